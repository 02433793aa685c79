//! Error types for geoplace_core.

use thiserror::Error;

/// Error types for orchestrator operations.
///
/// Stage adapters retry `StageTransient` internally; `StageFatal` means
/// retries are exhausted and the caller decides between fallback and abort.
/// `Cancelled` flows through results so a stage can abort without retrying.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{stage}: transient failure: {message}")]
    StageTransient { stage: &'static str, message: String },

    #[error("{stage}: failed after {attempts} attempts: {message}")]
    StageFatal {
        stage: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("sanity check failed: {0}")]
    Sanity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl GenError {
    /// Whether this error is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenError::Cancelled)
    }
}

/// Result type alias for orchestrator operations.
pub type GenResult<T> = Result<T, GenError>;
