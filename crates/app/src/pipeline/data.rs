//! Shared structs passed between pipeline stages.

use std::collections::BTreeMap;

use particle_core::FeatureVector;
use serde::{Deserialize, Serialize};

/// Durable unit of output: one measured, classified particle.
///
/// Uniquely identified by `(frame_id, region_index)`; immutable once written
/// to the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticleRecord {
    pub frame_id: u64,
    pub region_index: u32,
    #[serde(flatten)]
    pub features: FeatureVector,
    pub label: String,
    pub confidence: f32,
    /// Region touched the frame border or exceeded the area ceiling; the
    /// particle is likely cut off and size statistics should treat it warily.
    pub truncated: bool,
    pub timestamp_ms: i64,
}

/// Pipeline stage a frame was in when a recoverable error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Correct,
    Segment,
    Features,
    Classify,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Correct => "correct",
            Stage::Segment => "segment",
            Stage::Features => "features",
            Stage::Classify => "classify",
        }
    }
}

/// Why a frame was skipped. Skipped frames still advance the cursor with an
/// empty commit, so every reason here is recoverable by definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Frame could not be read or decoded.
    DecodeFailure,
    /// Frame shape does not match the background estimate.
    DimensionMismatch,
    /// A stage overran its configured deadline.
    Timeout(Stage),
}

impl SkipReason {
    pub fn label(self) -> &'static str {
        match self {
            SkipReason::DecodeFailure => "decode_failure",
            SkipReason::DimensionMismatch => "dimension_mismatch",
            SkipReason::Timeout(_) => "timeout",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Timeout(stage) => write!(f, "timeout in {} stage", stage.label()),
            SkipReason::DecodeFailure => f.write_str("decode failure"),
            SkipReason::DimensionMismatch => f.write_str("frame/background dimension mismatch"),
        }
    }
}

/// Terminal result of one frame, produced by a worker (or directly by the
/// orchestrator for frames that never reach the workers).
pub enum FrameOutcome {
    /// Frame fully processed; zero records is a valid outcome.
    Measured {
        records: Vec<ParticleRecord>,
        /// Number of segmented regions before degenerate filtering; feeds the
        /// background-update exclusion heuristic.
        region_count: usize,
    },
    /// Background model had absorbed too few frames; committed empty.
    WarmingUp,
    /// Recoverable per-frame error; committed empty.
    Skipped { reason: SkipReason },
}

/// One frame's result on its way to the commit writer.
pub struct CommitJob {
    pub seq: u64,
    pub outcome: FrameOutcome,
}

impl CommitJob {
    pub fn skipped(seq: u64, reason: SkipReason) -> Self {
        Self {
            seq,
            outcome: FrameOutcome::Skipped { reason },
        }
    }
}

/// End-of-run summary; every recoverable error is enumerable here.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub frames_seen: u64,
    pub frames_committed: u64,
    pub frames_measured: u64,
    pub warmup_frames: u64,
    pub frames_skipped: u64,
    pub skips_by_reason: BTreeMap<&'static str, u64>,
    pub particles: u64,
    pub final_cursor: Option<u64>,
}
