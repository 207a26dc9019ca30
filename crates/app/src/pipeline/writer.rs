//! Single-threaded commit writer.
//!
//! Workers finish frames in any order; durability demands commits in strict
//! sequence order so the cursor never skips ahead of an unwritten frame.
//! This thread reorders finished frames through a pending map and is the
//! only writer the store ever sees.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info};

use super::data::{CommitJob, FrameOutcome, ParticleRecord, RunReport};
use super::store::StatsStore;
use super::telemetry;

/// Counters accumulated by the writer, handed back when it exits.
pub(crate) struct WriterReport {
    pub(crate) counts: RunReport,
    /// Set when a commit failed; the store must be treated as suspect and the
    /// run terminated.
    pub(crate) store_error: Option<String>,
}

/// Spawn the commit writer thread.
///
/// `next_expected` is the first sequence number the writer will commit;
/// anything arriving out of order waits in the pending map. On a store error
/// the writer clears `running` and drains the channel without committing, so
/// upstream senders never block against a dead sink.
pub(crate) fn spawn_commit_writer(
    mut store: StatsStore,
    commit_rx: Receiver<CommitJob>,
    next_expected: u64,
    running: Arc<AtomicBool>,
    recent_regions: Arc<AtomicUsize>,
) -> io::Result<thread::JoinHandle<WriterReport>> {
    telemetry::spawn_thread("commit-writer", move || {
        run_writer(&mut store, commit_rx, next_expected, running, recent_regions)
    })
}

fn run_writer(
    store: &mut StatsStore,
    commit_rx: Receiver<CommitJob>,
    mut next_expected: u64,
    running: Arc<AtomicBool>,
    recent_regions: Arc<AtomicUsize>,
) -> WriterReport {
    let mut pending: BTreeMap<u64, FrameOutcome> = BTreeMap::new();
    let mut counts = RunReport::default();
    let mut store_error = None;

    'recv: for job in commit_rx.iter() {
        pending.insert(job.seq, job.outcome);

        while let Some(outcome) = pending.remove(&next_expected) {
            if let Err(err) = commit_one(
                store,
                next_expected,
                &outcome,
                &mut counts,
                &recent_regions,
            ) {
                error!("Commit of frame #{next_expected} failed: {err}");
                store_error = Some(err);
                running.store(false, Ordering::Relaxed);
                // Unblock senders; nothing more will be written.
                for discarded in commit_rx.iter() {
                    debug!("Discarding frame #{} after store failure", discarded.seq);
                }
                break 'recv;
            }
            next_expected += 1;
        }
    }

    if !pending.is_empty() && store_error.is_none() {
        // Channel closed with gaps outstanding; frames past the gap stay
        // uncommitted and will be reprocessed on resume.
        info!(
            "{} frame(s) held back behind missing frame #{next_expected}",
            pending.len()
        );
    }

    counts.final_cursor = store.resume_cursor();
    WriterReport {
        counts,
        store_error,
    }
}

fn commit_one(
    store: &mut StatsStore,
    seq: u64,
    outcome: &FrameOutcome,
    counts: &mut RunReport,
    recent_regions: &AtomicUsize,
) -> Result<(), String> {
    static EMPTY: &[ParticleRecord] = &[];
    let records = match outcome {
        FrameOutcome::Measured { records, .. } => records.as_slice(),
        FrameOutcome::WarmingUp | FrameOutcome::Skipped { .. } => EMPTY,
    };

    store.commit(seq, records).map_err(|err| err.to_string())?;

    counts.frames_committed += 1;
    metrics::counter!("particle_frames_committed_total").increment(1);
    match outcome {
        FrameOutcome::Measured {
            records,
            region_count,
        } => {
            counts.frames_measured += 1;
            counts.particles += records.len() as u64;
            recent_regions.store(*region_count, Ordering::Relaxed);
            metrics::counter!("particle_particles_total").increment(records.len() as u64);
            debug!(
                "Committed frame #{seq}: {} particle(s) from {region_count} region(s)",
                records.len()
            );
        }
        FrameOutcome::WarmingUp => {
            counts.warmup_frames += 1;
            debug!("Committed frame #{seq}: warming up, no measurements");
        }
        FrameOutcome::Skipped { reason } => {
            counts.frames_skipped += 1;
            *counts.skips_by_reason.entry(reason.label()).or_insert(0) += 1;
            metrics::counter!("particle_frames_skipped_total", "reason" => reason.label())
                .increment(1);
        }
    }
    Ok(())
}
