use std::io;
use thiserror::Error;

/// Unified error type for the staging proxy.
///
/// Every fallible operation of the crate returns this type. Variants follow the
/// failure taxonomy of the proxy: store durability and schema problems, staging
/// and transfer failures, and errors reported by the scheduler collaborator.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The persistent store could not read or durably commit an entry
    #[error("Store error: {0}")]
    Store(String),

    /// The persisted store was written under an incompatible layout
    #[error("Store schema error: {0}")]
    Schema(String),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Errors reported by the storage/transport collaborator
    #[error("Storage error: {0}")]
    Storage(String),

    /// A push or pull copy failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Errors reported by the scheduler collaborator
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The caller supplied an unknown job/task or a malformed value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed in the current proxy or job state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transfer pool was shut down before the unit could run
    #[error("Transfer pool has been shut down")]
    PoolShutdown,

    /// Errors related to IO operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures reported by the scheduler collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("not connected to the scheduler: {0}")]
    NotConnected(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("unknown task {task_name} in job {job_id}")]
    UnknownTask { job_id: String, task_name: String },

    #[error("submission closed: {0}")]
    SubmissionClosed(String),

    #[error("job creation failed: {0}")]
    JobCreation(String),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Returns the scheduler error kind when this error came from the scheduler
    pub fn scheduler_error(&self) -> Option<&SchedulerError> {
        match self {
            Self::Scheduler(err) => Some(err),
            _ => None,
        }
    }

    pub(crate) fn lock_poisoned(resource: &str) -> Self {
        Self::InvalidState(format!("Failed to acquire lock for {}", resource))
    }
}

/// Conversion from sled::Error to ProxyError
impl From<sled::Error> for ProxyError {
    fn from(error: sled::Error) -> Self {
        ProxyError::Store(error.to_string())
    }
}

/// Conversion from serde_json::Error to ProxyError
impl From<serde_json::Error> for ProxyError {
    fn from(error: serde_json::Error) -> Self {
        ProxyError::Serialization(error.to_string())
    }
}

/// Conversion from toml::de::Error to ProxyError
impl From<toml::de::Error> for ProxyError {
    fn from(error: toml::de::Error) -> Self {
        ProxyError::Config(error.to_string())
    }
}

/// Conversion from globset::Error to ProxyError
impl From<globset::Error> for ProxyError {
    fn from(error: globset::Error) -> Self {
        ProxyError::InvalidArgument(format!("invalid file pattern: {}", error))
    }
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Result type alias for scheduler collaborator calls
pub type SchedulerResult<T> = Result<T, SchedulerError>;
