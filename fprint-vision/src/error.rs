use thiserror::Error;

/// Failures between a raw capture and a finished descriptor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding model execution failed: {0}")]
    ModelExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;
