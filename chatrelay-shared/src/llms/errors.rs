//! # Completion Error Types
//!
//! Error type shared by every completion source.

use thiserror::Error;

/// Result type alias for completion operations
pub type CompletionResult<T> = Result<T, CompletionError>;

/// Failure while opening or consuming a completion stream
#[derive(Error, Debug)]
pub enum CompletionError {
    /// The upstream request could not be sent or the connection dropped
    #[error("Upstream transport error: {message}")]
    Transport { message: String },

    /// The upstream answered with a non-success status
    #[error("Upstream rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// A streamed chunk could not be decoded
    #[error("Malformed stream chunk: {details}")]
    MalformedChunk { details: String },

    /// No fragment arrived within the idle window
    #[error("No output received for {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The request itself was unusable
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl CompletionError {
    /// Create a new transport error
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new malformed chunk error
    pub fn malformed<T: Into<String>>(details: T) -> Self {
        Self::MalformedChunk {
            details: details.into(),
        }
    }

    /// Create a new invalid input error
    pub fn invalid_input<T: Into<String>>(message: T) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CompletionError {
    fn from(error: serde_json::Error) -> Self {
        Self::malformed(error.to_string())
    }
}
