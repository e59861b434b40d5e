//! Tiled image restoration.
//!
//! Images are split into overlapping tiles, each tile goes through an
//! external inference engine on a worker pool, and the results are stitched
//! back together. Around that sit an adaptive strength search driven by a
//! no-reference quality metric, a check that undoes rotated or mirrored
//! engine output, and persistent processing-time estimates for progress
//! reporting.
//!
//! The engine and the quality metric are supplied by the caller through
//! [`InferenceEngine`] and [`QualityScorer`].

pub mod error;
pub mod restore;
pub mod state;

pub use error::{EngineError, RestoreError, Result, ScoringError};
pub use restore::engine::{InferenceEngine, QualityScorer};
pub use restore::orchestrator::{JobOutcome, ProgressReport, ProgressSink, RestoredImage, Restorer};
pub use restore::timing::TimeEstimator;
pub use state::config::{BrisqueSettings, JobConfig, ModelParams, QualityModelPaths};
pub use state::data::{Image, RestorationJob, RunMode, TimingSample};
pub use state::progress::{JobStatus, ProcessingState};
pub use state::timings::TimingStore;
