//! Frame acquisition for the particle statistics pipeline.
//!
//! Sources deliver decoded frames over a bounded channel so that a slow
//! consumer backpressures the reader instead of buffering unbounded image
//! data. Every frame carries a monotonically increasing sequence id assigned
//! by the source; a frame that cannot be decoded is still delivered (as an
//! error carrying its sequence id) so the pipeline can account for it without
//! leaving a gap in the committed cursor range.

use anyhow::Error;
use thiserror::Error;

mod directory;
mod synthetic;
mod timestamp;

pub use directory::spawn_directory_reader;
pub use synthetic::SyntheticSource;
pub use timestamp::timestamp_from_filename;

/// Decoded grayscale or color frame read from a source.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic 1-based sequence id, stable across re-runs of the same input.
    pub seq: u64,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Gray8,
    Rgb8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Other(#[from] Error),
}

/// A frame slot that could not be decoded. The sequence id is preserved so
/// the consumer can skip the frame and still advance its cursor over it.
#[derive(Debug)]
pub struct FrameError {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub reason: CaptureError,
}

pub type FrameResult = Result<Frame, FrameError>;
