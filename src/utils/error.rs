//! Error types and handling
//!
//! Error taxonomy shared by the recording start/stop paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recording-wide error type
#[derive(Error, Debug)]
pub enum RecordingError {
    /// The worker or compositor could not be brought up
    #[error("Recording start error: {0}")]
    Start(String),

    /// The worker did not self-terminate within its bound
    #[error("Recording completion error: {0}")]
    Completion(String),

    /// The metadata report could not be read or written
    #[error("Recording report error: {0}")]
    Report(String),

    /// Malformed or missing custom layout
    #[error("Recording path not valid: {0}")]
    PathNotValid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecordingError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            RecordingError::Start(_) => "RECORDING_START_ERROR",
            RecordingError::Completion(_) => "RECORDING_COMPLETION_ERROR",
            RecordingError::Report(_) => "RECORDING_REPORT_ERROR",
            RecordingError::PathNotValid(_) => "RECORDING_PATH_NOT_VALID",
            RecordingError::Io(_) => "IO_ERROR",
            RecordingError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Error response for callers of the recording API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecordingError> for ErrorResponse {
    fn from(error: RecordingError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using RecordingError
pub type RecordingResult<T> = Result<T, RecordingError>;
