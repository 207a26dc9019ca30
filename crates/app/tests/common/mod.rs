//! Shared helpers for pipeline integration tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use app::pipeline::{BackgroundModeOption, PipelineConfig, ThresholdModeOption};

/// Unique per-test path prefix under the system temp directory.
pub fn temp_prefix(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("particle-e2e-{tag}-{}-{n}", std::process::id()))
}

/// Baseline configuration for synthetic-stream tests: no classifier, one
/// worker, fixed threshold, 1 px per physical unit so areas read in pixels.
pub fn base_config(output: PathBuf) -> PipelineConfig {
    PipelineConfig {
        input: std::env::temp_dir(),
        output,
        background_mode: BackgroundModeOption::Exponential,
        background_window: 5,
        background_skip_regions: None,
        threshold_mode: ThresholdModeOption::Fixed,
        threshold: 0.9,
        min_area: 10.0,
        max_area: None,
        pixels_per_unit: 1.0,
        labels: Vec::new(),
        model_path: None,
        crop_size: 32,
        workers: 1,
        stage_timeout_ms: 10_000,
        bin_min: 1.0,
        bin_max: 1_000.0,
        bin_count: 20,
        resume: false,
        verbose: false,
    }
}
