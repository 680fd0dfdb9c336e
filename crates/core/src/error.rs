use thiserror::Error as ThisError;

/// Store and engine error taxonomy.
///
/// Context cancellation of a long-lived loop is not an error; `Cancelled` is only
/// returned by single-shot store calls aborted before completion.
#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("watch stream terminated: {0}")]
    StreamTerminated(String),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Backend(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
