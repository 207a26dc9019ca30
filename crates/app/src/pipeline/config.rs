//! Configuration parsing for the processing pipeline.
//!
//! This module owns translation of CLI arguments into a `PipelineConfig`
//! struct which downstream stages use without re-parsing flags. Validation
//! fails fast here, before any frame is touched.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use particle_core::{BackgroundMode, Calibration, ThresholdMode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackgroundModeOption {
    Rolling,
    Exponential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdModeOption {
    Fixed,
    Percentile,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    /// Directory of frame files to process.
    pub input: PathBuf,
    /// Output path prefix for the statistics store files.
    pub output: PathBuf,
    pub background_mode: BackgroundModeOption,
    /// Window size (rolling) or decay horizon (exponential: decay = 1/window).
    pub background_window: usize,
    /// Withhold background updates when the previous frame segmented more
    /// than this many regions.
    pub background_skip_regions: Option<usize>,
    pub threshold_mode: ThresholdModeOption,
    /// Fixed corrected-intensity threshold, or lower percentile, depending
    /// on `threshold_mode`.
    pub threshold: f32,
    /// Minimum particle area in physical units squared.
    pub min_area: f32,
    /// Optional area ceiling in physical units squared; larger regions are
    /// flagged truncated.
    pub max_area: Option<f32>,
    /// Pixels per physical length unit (e.g. px/µm).
    pub pixels_per_unit: f32,
    /// Closed label set for the classifier, in model output order.
    pub labels: Vec<String>,
    /// TorchScript classifier path; absent means run unclassified.
    pub model_path: Option<PathBuf>,
    /// Square classifier input size in pixels.
    pub crop_size: u32,
    pub workers: usize,
    /// Per-stage deadline in milliseconds.
    pub stage_timeout_ms: u64,
    /// Size-bin range and count for the aggregate histograms (diameter,
    /// physical units).
    pub bin_min: f32,
    pub bin_max: f32,
    pub bin_count: usize,
    pub resume: bool,
    pub verbose: bool,
}

pub const PROCESS_USAGE: &str = "Usage: particle-pipeline process --input <dir> --output <prefix> \
[--background-mode rolling|exponential] [--background-window <n>] \
[--background-skip-regions <n>] [--threshold-mode fixed|percentile] [--threshold <v>] \
[--min-area <units^2>] [--max-area <units^2>] [--pixels-per-unit <px-per-unit>] \
[--labels <a,b,c>] [--model <path>] [--crop-size <px>] [--workers <n>] \
[--stage-timeout-ms <ms>] [--bins <n>] [--bin-min <units>] [--bin-max <units>] \
[--resume] [--verbose]";

impl PipelineConfig {
    /// Parse `process` subcommand arguments (`args` starts at the program
    /// name, the subcommand sits at index 1).
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut input: Option<PathBuf> = None;
        let mut output: Option<PathBuf> = None;
        let mut background_mode = BackgroundModeOption::Rolling;
        let mut background_window = 10usize;
        let mut background_skip_regions: Option<usize> = None;
        let mut threshold_mode = ThresholdModeOption::Fixed;
        let mut threshold: Option<f32> = None;
        let mut min_area = 12.0f32;
        let mut max_area: Option<f32> = None;
        let mut pixels_per_unit = 1.0f32;
        let mut labels: Vec<String> = Vec::new();
        let mut model_path: Option<PathBuf> = None;
        let mut crop_size = 64u32;
        let mut workers = 1usize;
        let mut stage_timeout_ms = 10_000u64;
        let mut bin_min = 1.0f32;
        let mut bin_max = 12_000.0f32;
        let mut bin_count = 52usize;
        let mut resume = false;
        let mut verbose = false;

        let mut idx = 2;
        while idx < args.len() {
            match args[idx].as_str() {
                "--input" => {
                    input = Some(PathBuf::from(take_value(args, &mut idx, "--input")?));
                }
                "--output" => {
                    output = Some(PathBuf::from(take_value(args, &mut idx, "--output")?));
                }
                "--background-mode" => {
                    background_mode = match take_value(args, &mut idx, "--background-mode")? {
                        v if v == "rolling" => BackgroundModeOption::Rolling,
                        v if v == "exponential" => BackgroundModeOption::Exponential,
                        other => bail!("--background-mode must be rolling|exponential, got {other}"),
                    };
                }
                "--background-window" => {
                    background_window = parse_value(args, &mut idx, "--background-window")?;
                }
                "--background-skip-regions" => {
                    background_skip_regions =
                        Some(parse_value(args, &mut idx, "--background-skip-regions")?);
                }
                "--threshold-mode" => {
                    threshold_mode = match take_value(args, &mut idx, "--threshold-mode")? {
                        v if v == "fixed" => ThresholdModeOption::Fixed,
                        v if v == "percentile" => ThresholdModeOption::Percentile,
                        other => bail!("--threshold-mode must be fixed|percentile, got {other}"),
                    };
                }
                "--threshold" => {
                    threshold = Some(parse_value(args, &mut idx, "--threshold")?);
                }
                "--min-area" => {
                    min_area = parse_value(args, &mut idx, "--min-area")?;
                }
                "--max-area" => {
                    max_area = Some(parse_value(args, &mut idx, "--max-area")?);
                }
                "--pixels-per-unit" => {
                    pixels_per_unit = parse_value(args, &mut idx, "--pixels-per-unit")?;
                }
                "--labels" => {
                    labels = take_value(args, &mut idx, "--labels")?
                        .split(',')
                        .map(|label| label.trim().to_string())
                        .filter(|label| !label.is_empty())
                        .collect();
                }
                "--model" => {
                    model_path = Some(PathBuf::from(take_value(args, &mut idx, "--model")?));
                }
                "--crop-size" => {
                    crop_size = parse_value(args, &mut idx, "--crop-size")?;
                }
                "--workers" => {
                    workers = parse_value(args, &mut idx, "--workers")?;
                }
                "--stage-timeout-ms" => {
                    stage_timeout_ms = parse_value(args, &mut idx, "--stage-timeout-ms")?;
                }
                "--bins" => {
                    bin_count = parse_value(args, &mut idx, "--bins")?;
                }
                "--bin-min" => {
                    bin_min = parse_value(args, &mut idx, "--bin-min")?;
                }
                "--bin-max" => {
                    bin_max = parse_value(args, &mut idx, "--bin-max")?;
                }
                "--resume" => {
                    resume = true;
                    idx += 1;
                }
                "--verbose" => {
                    verbose = true;
                    idx += 1;
                }
                arg => {
                    bail!("Unrecognised argument: {arg}\n{PROCESS_USAGE}");
                }
            }
        }

        let input =
            input.ok_or_else(|| anyhow!("Missing --input <dir>.\n{PROCESS_USAGE}"))?;
        let output =
            output.ok_or_else(|| anyhow!("Missing --output <prefix>.\n{PROCESS_USAGE}"))?;
        let threshold = threshold.unwrap_or(match threshold_mode {
            ThresholdModeOption::Fixed => 0.9,
            ThresholdModeOption::Percentile => 2.0,
        });

        let config = Self {
            input,
            output,
            background_mode,
            background_window,
            background_skip_regions,
            threshold_mode,
            threshold,
            min_area,
            max_area,
            pixels_per_unit,
            labels,
            model_path,
            crop_size,
            workers,
            stage_timeout_ms,
            bin_min,
            bin_max,
            bin_count,
            resume,
            verbose,
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on configuration that would corrupt results downstream.
    pub fn validate(&self) -> Result<()> {
        if self.background_window == 0 {
            bail!("background window must be at least 1");
        }
        if !(self.pixels_per_unit.is_finite() && self.pixels_per_unit > 0.0) {
            bail!("pixels-per-unit must be a positive, finite calibration factor");
        }
        match self.threshold_mode {
            ThresholdModeOption::Fixed => {
                if !(0.0..=1.0).contains(&self.threshold) {
                    bail!("fixed threshold must be within [0, 1]");
                }
            }
            ThresholdModeOption::Percentile => {
                if !(0.0..100.0).contains(&self.threshold) {
                    bail!("percentile threshold must be within [0, 100)");
                }
            }
        }
        if self.min_area <= 0.0 {
            bail!("min-area must be positive");
        }
        if let Some(max_area) = self.max_area {
            if max_area <= self.min_area {
                bail!("max-area must exceed min-area");
            }
        }
        if self.model_path.is_some() && self.labels.is_empty() {
            bail!("a classifier model requires a non-empty --labels set");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.stage_timeout_ms == 0 {
            bail!("stage-timeout-ms must be positive");
        }
        if self.crop_size == 0 {
            bail!("crop-size must be positive");
        }
        if self.bin_count == 0 || self.bin_min <= 0.0 || self.bin_max <= self.bin_min {
            bail!("size bins require 0 < bin-min < bin-max and at least one bin");
        }
        Ok(())
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            pixels_per_unit: self.pixels_per_unit,
        }
    }

    pub fn background(&self) -> BackgroundMode {
        match self.background_mode {
            BackgroundModeOption::Rolling => BackgroundMode::Rolling {
                window: self.background_window,
            },
            BackgroundModeOption::Exponential => BackgroundMode::Exponential {
                decay: 1.0 / self.background_window as f32,
            },
        }
    }

    pub fn threshold(&self) -> ThresholdMode {
        match self.threshold_mode {
            ThresholdModeOption::Fixed => ThresholdMode::Fixed(self.threshold),
            ThresholdModeOption::Percentile => ThresholdMode::Percentile(self.threshold),
        }
    }

    /// Configured physical area floor converted to a pixel count, applied by
    /// the segmenter. At least 1 so a zero-pixel floor cannot occur.
    pub fn min_area_px(&self) -> usize {
        (self.calibration().area_to_px(self.min_area).round() as usize).max(1)
    }

    pub fn max_area_px(&self) -> Option<usize> {
        self.max_area
            .map(|area| (self.calibration().area_to_px(area).round() as usize).max(1))
    }
}

fn take_value<'a>(args: &'a [String], idx: &mut usize, flag: &str) -> Result<&'a str> {
    *idx += 1;
    let value = args
        .get(*idx)
        .ok_or_else(|| anyhow!("{flag} requires a value"))?;
    *idx += 1;
    Ok(value.as_str())
}

fn parse_value<T: std::str::FromStr>(args: &[String], idx: &mut usize, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    take_value(args, idx, flag)?
        .parse::<T>()
        .with_context(|| format!("{flag} must be a valid number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Vec<String> {
        let mut all = vec![
            "particle-pipeline".to_string(),
            "process".to_string(),
            "--input".to_string(),
            "frames".to_string(),
            "--output".to_string(),
            "proc/run1".to_string(),
        ];
        all.extend(extra.iter().map(|s| s.to_string()));
        all
    }

    #[test]
    fn defaults_are_applied() {
        let config = PipelineConfig::from_args(&args(&[])).expect("config");
        assert_eq!(config.background_mode, BackgroundModeOption::Rolling);
        assert_eq!(config.background_window, 10);
        assert_eq!(config.threshold, 0.9);
        assert_eq!(config.workers, 1);
        assert!(!config.resume);
    }

    #[test]
    fn percentile_mode_has_its_own_default_threshold() {
        let config = PipelineConfig::from_args(&args(&["--threshold-mode", "percentile"]))
            .expect("config");
        assert_eq!(config.threshold, 2.0);
        assert!(matches!(config.threshold(), ThresholdMode::Percentile(_)));
    }

    #[test]
    fn area_bounds_convert_to_pixels_using_the_calibration() {
        let config = PipelineConfig::from_args(&args(&[
            "--pixels-per-unit",
            "2.0",
            "--min-area",
            "3.0",
            "--max-area",
            "100.0",
        ]))
        .expect("config");
        assert_eq!(config.min_area_px(), 12, "3 units^2 * (2 px/unit)^2");
        assert_eq!(config.max_area_px(), Some(400));
    }

    #[test]
    fn invalid_configuration_fails_fast() {
        for bad in [
            vec!["--pixels-per-unit", "0"],
            vec!["--background-window", "0"],
            vec!["--threshold", "1.5"],
            vec!["--model", "net.pt"],
            vec!["--workers", "0"],
            vec!["--min-area", "50", "--max-area", "10"],
        ] {
            let bad: Vec<&str> = bad;
            assert!(
                PipelineConfig::from_args(&args(&bad)).is_err(),
                "expected failure for {bad:?}"
            );
        }
    }

    #[test]
    fn labels_are_split_and_trimmed() {
        let config = PipelineConfig::from_args(&args(&["--labels", "copepod, diatom,oil"]))
            .expect("config");
        assert_eq!(config.labels, vec!["copepod", "diatom", "oil"]);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(PipelineConfig::from_args(&args(&["--nope"])).is_err());
    }
}
