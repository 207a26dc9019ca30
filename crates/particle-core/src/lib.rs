//! Image-domain algorithms for the particle statistics pipeline: background
//! modelling, segmentation into candidate particle regions, per-region
//! feature extraction, and the classifier adapter.
//!
//! This crate owns no I/O; callers hand it pixel buffers and take back
//! measurements. The optional `with-tch` feature pulls in the `tch` crate for
//! a TorchScript-backed classifier.

pub mod background;
pub mod classify;
pub mod features;
pub mod image;
pub mod segment;

pub use background::{BackgroundError, BackgroundMode, BackgroundModel, CorrectedFrame};
pub use classify::{Classifier, ClassifyError, Crop, DisabledClassifier, Prediction, UNCLASSIFIED_LABEL};
pub use features::{Calibration, FeatureError, FeatureVector};
pub use image::GrayFrame;
pub use segment::{NoSplit, Region, RegionSplitter, Segmenter, SegmenterOptions, ThresholdMode};

#[cfg(feature = "with-tch")]
pub use classify::torch::TorchClassifier;

#[cfg(feature = "with-tch")]
pub use tch;
