use std::io;
use std::path::Path;
use thiserror::Error;

/// Result type used across the relay crate
pub type Result<T> = std::result::Result<T, RelayError>;

/// Process exit codes shared by the job-step binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    InvalidArgument = 1,
    Interrupted = 2,
    RuntimeError = 3,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed configuration, raised before any side effect
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem failure that is not a plain "does not exist"
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("job {0} already exists")]
    AlreadyExists(String),

    #[error("stopped watching job {0} before it succeeded")]
    WatchEnded(String),

    #[error("job {0} failed")]
    JobFailed(String),

    #[error("file system watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Observed state contradicts what the pipeline expects, always fatal for the run
    #[error("inconsistent state: {0}")]
    Inconsistency(String),

    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::Inconsistency(msg.into())
    }

    /// Wrap an io error with the operation and path it came from
    pub fn io(op: &str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context: format!("cannot {} {}", op, path.display()),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::InvalidArgument(_) => ExitStatus::InvalidArgument,
            Self::Cancelled => ExitStatus::Interrupted,
            _ => ExitStatus::RuntimeError,
        }
    }
}
