use thiserror::Error;

/// Failures raised by a repository implementation.
///
/// Only `Transient` is retried; the rest escalate straight to the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("transient repository failure: {0}")]
    Transient(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("sequence counter `{0}` exhausted")]
    SequenceExhausted(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum PaymentProcessError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sequence allocation failed for `{counter}`: {reason}")]
    SequenceAllocation { counter: String, reason: String },
    #[error("concurrency violation: {0}")]
    Concurrency(String),
    #[error("illegal run state transition from {from} to {to}")]
    ProcessingState { from: String, to: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for RepositoryError {
    fn from(err: rocksdb::Error) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentProcessError>;
pub type RepoResult<T> = std::result::Result<T, RepositoryError>;
