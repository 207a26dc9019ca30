//! Pipeline orchestration: frame source, background model, worker pool, and
//! the ordered commit writer, wired up and torn down in one place.
//!
//! The orchestrator owns the only mutable background estimate and applies
//! updates strictly in frame sequence order before handing corrected frames
//! to the workers. Everything downstream may run out of order; the commit
//! writer restores sequence before anything touches the store.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use frame_ingest::{Frame, FrameFormat, FrameResult, spawn_directory_reader};
use particle_core::{
    BackgroundModel, Classifier, DisabledClassifier, GrayFrame, Segmenter, SegmenterOptions,
};
use tracing::{error, info, warn};

use super::config::PipelineConfig;
use super::data::{CommitJob, RunReport, SkipReason};
use super::processing::{FrameTask, WorkerContext, spawn_processing_worker};
use super::stats::SizeBins;
use super::store::StatsStore;
use super::telemetry;
use super::writer::spawn_commit_writer;

static CTRLC_INIT: Once = Once::new();

/// Open (or create) the statistics store named by the configured output
/// prefix, honouring the resume flag.
pub fn open_store(config: &PipelineConfig) -> Result<StatsStore> {
    let bins = SizeBins::logarithmic(config.bin_min, config.bin_max, config.bin_count);
    StatsStore::open(&config.output, bins, config.resume)
        .with_context(|| format!("opening statistics store at {}", config.output.display()))
}

/// Process a frame directory end to end and return the run summary.
///
/// Installs a Ctrl-C handler on first use; an interrupt stops intake after
/// the current frame and the store stays committed up to the last frame that
/// fully finished.
pub fn run(config: PipelineConfig) -> Result<RunReport> {
    config.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        CTRLC_INIT.call_once(|| {
            if let Err(err) = ctrlc::set_handler(move || {
                warn!("Interrupt received, finishing in-flight frames");
                shutdown.store(true, Ordering::Relaxed);
            }) {
                warn!("Could not install interrupt handler: {err}");
            }
        });
    }

    let store = open_store(&config)?;
    let resume_after = store.resume_cursor();
    if let Some(cursor) = resume_after {
        info!("Resuming after committed frame #{cursor}");
    }
    let frames = spawn_directory_reader(&config.input, resume_after)
        .with_context(|| format!("reading frames from {}", config.input.display()))?;

    run_stream(&config, store, frames, shutdown)
}

/// Drive the pipeline over an already-open store and frame stream.
///
/// Split out from [`run`] so tests can feed synthetic frames and inspect the
/// store afterwards.
pub fn run_stream(
    config: &PipelineConfig,
    store: StatsStore,
    frames: Receiver<FrameResult>,
    shutdown: Arc<AtomicBool>,
) -> Result<RunReport> {
    telemetry::init_metrics_recorder();

    let next_expected = store.resume_cursor().map_or(1, |cursor| cursor + 1);
    let running = Arc::new(AtomicBool::new(true));
    let recent_regions = Arc::new(AtomicUsize::new(0));

    let workers = config.workers.max(1);
    let (work_tx, work_rx) = bounded::<FrameTask>(workers * 2);
    let (commit_tx, commit_rx) = bounded::<CommitJob>(workers * 2);

    let writer_handle = spawn_commit_writer(
        store,
        commit_rx,
        next_expected,
        Arc::clone(&running),
        Arc::clone(&recent_regions),
    )
    .context("spawning commit writer")?;

    let worker_context = Arc::new(WorkerContext {
        segmenter: Segmenter::new(SegmenterOptions {
            threshold: config.threshold(),
            min_area_px: config.min_area_px(),
            max_area_px: config.max_area_px(),
        }),
        calibration: config.calibration(),
        classifier: build_classifier(config),
        stage_timeout: Duration::from_millis(config.stage_timeout_ms),
        crop_size: config.crop_size,
    });

    let mut worker_handles = Vec::with_capacity(workers);
    for index in 0..workers {
        worker_handles.push(
            spawn_processing_worker(
                index,
                Arc::clone(&worker_context),
                work_rx.clone(),
                commit_tx.clone(),
                Arc::clone(&running),
            )
            .context("spawning processing worker")?,
        );
    }
    drop(work_rx);

    let mut background = BackgroundModel::new(config.background());
    let mut frames_seen: u64 = 0;

    // Fetch in short ticks so shutdown stays responsive and a stalled source
    // cannot block intake forever; a source silent for a whole stage timeout
    // ends the run cleanly with the cursor intact.
    let stage_timeout = Duration::from_millis(config.stage_timeout_ms);
    let fetch_tick = stage_timeout.min(Duration::from_millis(50));
    let mut source_silent = Duration::ZERO;

    'intake: loop {
        if shutdown.load(Ordering::Relaxed) || !running.load(Ordering::Relaxed) {
            break;
        }
        let result = match frames.recv_timeout(fetch_tick) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                source_silent += fetch_tick;
                if source_silent >= stage_timeout {
                    warn!(
                        "Frame source silent for {}ms, stopping intake",
                        source_silent.as_millis()
                    );
                    metrics::counter!("particle_source_stalls_total").increment(1);
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        source_silent = Duration::ZERO;
        frames_seen += 1;

        let frame = match result {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Frame #{} unreadable: {}", err.seq, err.reason);
                if commit_tx
                    .send(CommitJob::skipped(err.seq, SkipReason::DecodeFailure))
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };
        let seq = frame.seq;
        let timestamp_ms = frame.timestamp_ms;

        let gray = match to_gray(&frame) {
            Some(gray) => gray,
            None => {
                warn!("Frame #{seq} has inconsistent pixel buffer, skipping");
                if commit_tx
                    .send(CommitJob::skipped(seq, SkipReason::DecodeFailure))
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        // Withhold the background update when the most recently committed
        // frame was crowded; dense scenes bleed particles into the estimate.
        // With several workers that count can trail the current frame by the
        // pool depth, not just one frame.
        let withhold_update = config
            .background_skip_regions
            .is_some_and(|limit| recent_regions.load(Ordering::Relaxed) > limit);
        if withhold_update {
            metrics::counter!("particle_background_updates_withheld_total").increment(1);
        } else if let Err(err) = background.update(&gray) {
            warn!("Frame #{seq}: {err}");
            if commit_tx
                .send(CommitJob::skipped(seq, SkipReason::DimensionMismatch))
                .is_err()
            {
                break;
            }
            continue;
        }

        let corrected = match background.correct(&gray) {
            Ok(corrected) => corrected,
            Err(err) => {
                warn!("Frame #{seq}: {err}");
                if commit_tx
                    .send(CommitJob::skipped(seq, SkipReason::DimensionMismatch))
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        if corrected.warming_up {
            if commit_tx
                .send(CommitJob {
                    seq,
                    outcome: super::data::FrameOutcome::WarmingUp,
                })
                .is_err()
            {
                break;
            }
            continue;
        }

        let task = FrameTask {
            seq,
            timestamp_ms,
            corrected: corrected.frame,
        };
        if work_tx.send(task).is_err() {
            error!("All workers exited early, stopping intake");
            break 'intake;
        }
    }

    drop(work_tx);
    for handle in worker_handles {
        if handle.join().is_err() {
            error!("A processing worker panicked");
        }
    }
    drop(commit_tx);
    let writer_report = match writer_handle.join() {
        Ok(report) => report,
        Err(_) => bail!("commit writer panicked"),
    };

    let mut report = writer_report.counts;
    report.frames_seen = frames_seen;

    info!(
        "Run finished: {} seen, {} committed ({} measured, {} warm-up, {} skipped), {} particle(s), cursor {:?}",
        report.frames_seen,
        report.frames_committed,
        report.frames_measured,
        report.warmup_frames,
        report.frames_skipped,
        report.particles,
        report.final_cursor,
    );
    for (reason, count) in &report.skips_by_reason {
        info!("  skipped {count} frame(s): {reason}");
    }

    if let Some(message) = writer_report.store_error {
        bail!("statistics store failed mid-run: {message}");
    }
    Ok(report)
}

fn to_gray(frame: &Frame) -> Option<GrayFrame> {
    match frame.format {
        FrameFormat::Gray8 => GrayFrame::from_gray8(&frame.data, frame.width, frame.height),
        FrameFormat::Rgb8 => GrayFrame::from_rgb8(&frame.data, frame.width, frame.height),
    }
}

/// An unavailable classifier must not stop the run; size and count
/// statistics keep flowing with every particle labelled `unclassified`.
#[cfg(not(feature = "with-tch"))]
fn build_classifier(config: &PipelineConfig) -> Box<dyn Classifier> {
    if let Some(path) = &config.model_path {
        warn!(
            "Model {} requires a build with the with-tch feature; labelling everything unclassified",
            path.display()
        );
        metrics::counter!("particle_classifier_failures_total").increment(1);
    }
    Box::new(DisabledClassifier)
}

#[cfg(feature = "with-tch")]
fn build_classifier(config: &PipelineConfig) -> Box<dyn Classifier> {
    use particle_core::classify::torch::TorchClassifier;
    use particle_core::tch::Device;

    let Some(path) = &config.model_path else {
        return Box::new(DisabledClassifier);
    };
    let size = config.crop_size as i64;
    match TorchClassifier::new(
        path,
        Device::cuda_if_available(),
        config.labels.clone(),
        (size, size),
    ) {
        Ok(classifier) => {
            info!("Loaded classifier model from {}", path.display());
            Box::new(classifier)
        }
        Err(err) => {
            warn!(
                "Could not load classifier model {}; labelling everything unclassified: {err:#}",
                path.display()
            );
            metrics::counter!("particle_classifier_failures_total").increment(1);
            Box::new(DisabledClassifier)
        }
    }
}
