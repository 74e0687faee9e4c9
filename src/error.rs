use fprint_vision::VisionError;
use thiserror::Error;

/// Every way an enroll, verify or delete can fail.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding model execution failed: {0}")]
    ModelExecutionFailed(String),

    #[error("descriptor store is corrupt: {0}")]
    StorageReadCorrupt(String),

    #[error("descriptor store write failed: {0}")]
    StorageWriteFailed(String),

    #[error("no fingerprint {position} (store holds {len})")]
    OutOfRange { position: usize, len: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<VisionError> for Error {
    fn from(e: VisionError) -> Self {
        match e {
            VisionError::InvalidImage(m) => Error::InvalidImage(m),
            VisionError::ModelUnavailable(m) => Error::ModelUnavailable(m),
            VisionError::ModelExecutionFailed(m) => Error::ModelExecutionFailed(m),
        }
    }
}
