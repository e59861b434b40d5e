/// Error types for the restoration pipeline
///
/// The taxonomy mirrors how failures are handled:
/// - engine failures are fatal to the job
/// - scoring failures are absorbed by the strength search (fallback strength)
/// - geometry/config failures are rejected before any work starts
/// - cancellation ends the job with its own variant so callers can word it gently

use thiserror::Error;

/// Error returned by the external inference engine
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure classes reported by the quality scorer through negative scores
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoringError {
    /// Scorer returned -1: the image file is missing or could not be decoded
    #[error("image could not be read for scoring")]
    ImageUnreadable,

    /// Scorer returned -2: model/range files missing or failed to load
    #[error("quality model unavailable")]
    ModelUnavailable,

    /// Any other negative code
    #[error("scorer failed with code {0}")]
    Internal(f32),

    /// Every candidate in a search was excluded
    #[error("no candidate strength could be scored")]
    NoScorableCandidate,
}

impl ScoringError {
    /// Map a raw scorer return value to a score or a failure class
    pub fn classify(raw: f32) -> std::result::Result<f32, ScoringError> {
        if raw.is_nan() {
            return Err(ScoringError::Internal(raw));
        }
        if raw >= 0.0 {
            return Ok(raw);
        }
        if raw == -1.0 {
            Err(ScoringError::ImageUnreadable)
        } else if raw == -2.0 {
            Err(ScoringError::ModelUnavailable)
        } else {
            Err(ScoringError::Internal(raw))
        }
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("invalid tile geometry: {0}")]
    Geometry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("inference failed on image {image}, chunk {chunk}: {source}")]
    Engine {
        image: usize,
        chunk: usize,
        #[source]
        source: EngineError,
    },

    #[error("quality scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("processing cancelled")]
    Cancelled,

    #[error("timing store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RestoreError {
    /// True for user-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_scores() {
        assert_eq!(ScoringError::classify(23.5), Ok(23.5));
        assert_eq!(ScoringError::classify(0.0), Ok(0.0));
        assert_eq!(ScoringError::classify(-1.0), Err(ScoringError::ImageUnreadable));
        assert_eq!(ScoringError::classify(-2.0), Err(ScoringError::ModelUnavailable));
        assert_eq!(ScoringError::classify(-7.0), Err(ScoringError::Internal(-7.0)));
        assert!(ScoringError::classify(f32::NAN).is_err());
    }

    #[test]
    fn test_engine_error_message() {
        let err = RestoreError::Engine {
            image: 1,
            chunk: 3,
            source: EngineError::new("out of memory"),
        };
        assert_eq!(err.to_string(), "inference failed on image 1, chunk 3: out of memory");
        assert!(!err.is_cancelled());
        assert!(RestoreError::Cancelled.is_cancelled());
    }
}
