//! Particle statistics pipeline application: configuration, orchestration,
//! and the persistent statistics store. The binary front-end lives in
//! `main.rs`; everything below is exposed as a library so integration tests
//! can drive the pipeline against synthetic frame streams.

pub mod pipeline;
