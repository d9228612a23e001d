//! Pipeline orchestration.
//!
//! The pipeline is a single-threaded, strictly ordered batch job; each
//! stage finishes its writes before the next begins, and resumability comes
//! from checkpointing the annotated tree between stages rather than from
//! retrying any stage in place.

pub mod processor;

pub use processor::{DriftPipeline, PipelineConfig};
