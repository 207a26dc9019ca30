//! Frame-to-statistics processing pipeline.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing and validation.
//! - `pipeline`: Orchestrates the fetch → correct → dispatch loop.
//! - `processing`: Worker threads running segmentation, features, and
//!   classification per frame.
//! - `writer`: Single commit thread applying frame results to the store in
//!   strict sequence order.
//! - `store`: Append-only record log with crash-resumable cursor.
//! - `stats`: Aggregate counters and size-bin histograms.
//! - `data`: Shared structs passed between stages.
//! - `telemetry`: tracing/metrics bootstrap shared by every thread.

pub use config::{BackgroundModeOption, PipelineConfig, ThresholdModeOption};
pub use data::{FrameOutcome, ParticleRecord, RunReport, SkipReason, Stage};
pub use pipeline::{open_store, run, run_stream};
pub use stats::{AggregateStats, SizeBins};
pub use store::{StatsStore, StoreError, VerifyReport, verify};

pub mod config;
pub mod data;
mod pipeline;
mod processing;
pub mod stats;
pub mod store;
pub mod telemetry;
mod writer;
