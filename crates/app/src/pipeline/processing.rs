//! Worker threads running segmentation, feature extraction, and
//! classification on independently owned corrected frames.
//!
//! Workers share nothing mutable: each consumes `FrameTask`s from the work
//! queue and emits one `CommitJob` per frame, in whatever order frames
//! finish. Sequence ordering is restored downstream by the commit writer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use particle_core::{
    Calibration, Classifier, ClassifyError, GrayFrame, Prediction, Region, Segmenter,
    classify, features,
};
use tracing::{debug, error, warn};

use super::data::{CommitJob, FrameOutcome, ParticleRecord, SkipReason, Stage};
use super::telemetry;

/// Unit of work consumed by processing workers: one corrected frame, owned
/// outright.
pub(crate) struct FrameTask {
    pub(crate) seq: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) corrected: GrayFrame,
}

/// Immutable per-run context shared (read-only) by every worker.
pub(crate) struct WorkerContext {
    pub(crate) segmenter: Segmenter,
    pub(crate) calibration: Calibration,
    pub(crate) classifier: Box<dyn Classifier>,
    pub(crate) stage_timeout: Duration,
    pub(crate) crop_size: u32,
}

/// Spawn one processing worker.
///
/// The worker drains the frame queue until it closes or the pipeline stops
/// running; every received frame is answered with exactly one `CommitJob`.
pub(crate) fn spawn_processing_worker(
    worker_index: usize,
    context: Arc<WorkerContext>,
    work_rx: Receiver<FrameTask>,
    commit_tx: Sender<CommitJob>,
    running: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("particle-worker-{worker_index}"), move || {
        let mut classifier_warned = false;
        for task in work_rx.iter() {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let job = process_frame(&context, task, &mut classifier_warned);
            if commit_tx.send(job).is_err() {
                error!("Commit channel closed, stopping worker #{worker_index}");
                break;
            }
        }
    })
}

/// Run one frame through segment → features → classify, converting stage
/// deadline overruns and per-region degeneracies into the right outcomes.
pub(crate) fn process_frame(
    context: &WorkerContext,
    task: FrameTask,
    classifier_warned: &mut bool,
) -> CommitJob {
    let seq = task.seq;

    let stage_start = Instant::now();
    let regions = context.segmenter.segment(&task.corrected, seq);
    metrics::histogram!("particle_stage_seconds", "stage" => Stage::Segment.label())
        .record(stage_start.elapsed().as_secs_f64());
    if stage_start.elapsed() > context.stage_timeout {
        return skip(seq, SkipReason::Timeout(Stage::Segment));
    }
    let region_count = regions.len();
    if regions.is_empty() {
        // Valid outcome: particle-free water.
        return CommitJob {
            seq,
            outcome: FrameOutcome::Measured {
                records: Vec::new(),
                region_count: 0,
            },
        };
    }

    let stage_start = Instant::now();
    let mut measured: Vec<Region> = Vec::with_capacity(regions.len());
    let mut vectors = Vec::with_capacity(regions.len());
    for region in regions {
        if stage_start.elapsed() > context.stage_timeout {
            return skip(seq, SkipReason::Timeout(Stage::Features));
        }
        match features::extract(&region, &task.corrected, &context.calibration) {
            Ok(vector) => {
                vectors.push(vector);
                measured.push(region);
            }
            Err(err) => {
                // Skip the region, not the frame.
                debug!("frame #{seq} region {}: {err}", region.index);
                metrics::counter!("particle_regions_discarded_total", "reason" => "degenerate")
                    .increment(1);
            }
        }
    }
    metrics::histogram!("particle_stage_seconds", "stage" => Stage::Features.label())
        .record(stage_start.elapsed().as_secs_f64());

    let stage_start = Instant::now();
    let predictions = classify_regions(context, &task.corrected, &measured, classifier_warned);
    metrics::histogram!("particle_stage_seconds", "stage" => Stage::Classify.label())
        .record(stage_start.elapsed().as_secs_f64());
    if stage_start.elapsed() > context.stage_timeout {
        return skip(seq, SkipReason::Timeout(Stage::Classify));
    }

    let records = measured
        .iter()
        .zip(vectors)
        .zip(predictions)
        .map(|((region, features), prediction)| ParticleRecord {
            frame_id: seq,
            region_index: region.index,
            features,
            label: prediction.label,
            confidence: prediction.confidence.clamp(0.0, 1.0),
            truncated: region.truncated,
            timestamp_ms: task.timestamp_ms,
        })
        .collect();

    CommitJob {
        seq,
        outcome: FrameOutcome::Measured {
            records,
            region_count,
        },
    }
}

/// Classify the surviving regions, degrading to `unclassified` when the
/// classifier is disabled or unavailable; statistics must keep flowing.
fn classify_regions(
    context: &WorkerContext,
    corrected: &GrayFrame,
    regions: &[Region],
    classifier_warned: &mut bool,
) -> Vec<Prediction> {
    if !context.classifier.enabled() {
        return regions.iter().map(|_| Prediction::unclassified()).collect();
    }

    let crops: Vec<_> = regions
        .iter()
        .map(|region| classify::crop_region(corrected, region, context.crop_size))
        .collect();
    match context.classifier.predict(&crops) {
        Ok(predictions) if predictions.len() == regions.len() => predictions,
        Ok(predictions) => {
            warn!(
                "Classifier returned {} prediction(s) for {} region(s); degrading to unclassified",
                predictions.len(),
                regions.len()
            );
            metrics::counter!("particle_classifier_failures_total").increment(1);
            regions.iter().map(|_| Prediction::unclassified()).collect()
        }
        Err(err) => {
            if !*classifier_warned {
                warn!("Classifier unavailable, labelling as unclassified: {err}");
                *classifier_warned = true;
            }
            if matches!(err, ClassifyError::Unavailable(_)) {
                metrics::counter!("particle_classifier_failures_total").increment(1);
            }
            regions.iter().map(|_| Prediction::unclassified()).collect()
        }
    }
}

fn skip(seq: u64, reason: SkipReason) -> CommitJob {
    warn!("Skipping frame #{seq}: {reason}");
    CommitJob::skipped(seq, reason)
}
