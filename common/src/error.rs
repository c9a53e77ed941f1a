//! Error taxonomy shared by every file operation in this crate.
//!
//! # Logging Convention
//! `Display` names the failing side and path together with the I/O cause, so errors can be
//! logged directly:
//! ```ignore
//! tracing::error!("replication failed: {}", &error);
//! ```

use std::sync::Arc;

/// Which end of a copy an error refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Source,
    Destination,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

/// I/O causes are shared so the same failure can be handed to more than one observer
/// (e.g. both the progress stream and the completion handle of a transfer).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{side} {path:?} does not exist")]
    NotFound {
        side: Side,
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("permission denied on {side} {path:?}")]
    PermissionDenied {
        side: Side,
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("{side} {path:?} is not a directory")]
    NotADirectory { side: Side, path: std::path::PathBuf },
    #[error("{side} {path:?} is a directory")]
    IsADirectory { side: Side, path: std::path::PathBuf },
    #[error("failed creating destination directory {path:?}")]
    DestinationCreateFailed {
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed reading {side} {path:?}")]
    ReadFailure {
        side: Side,
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed writing {side} {path:?}")]
    WriteFailure {
        side: Side,
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("job queue closed before all jobs were submitted")]
    QueueClosedPrematurely,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// Fallback used by [`Error::from_io`] when the I/O error kind has no dedicated variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fallback {
    Read,
    Write,
    CreateDir,
}

impl Error {
    /// Classify an I/O error into the taxonomy.
    #[must_use]
    pub fn from_io(
        side: Side,
        path: &std::path::Path,
        error: std::io::Error,
        fallback: Fallback,
    ) -> Self {
        let path = path.to_path_buf();
        match error.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound {
                side,
                path,
                source: Arc::new(error),
            },
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                side,
                path,
                source: Arc::new(error),
            },
            std::io::ErrorKind::NotADirectory => Error::NotADirectory { side, path },
            std::io::ErrorKind::IsADirectory => Error::IsADirectory { side, path },
            _ => match fallback {
                Fallback::Read => Error::ReadFailure {
                    side,
                    path,
                    source: Arc::new(error),
                },
                Fallback::Write => Error::WriteFailure {
                    side,
                    path,
                    source: Arc::new(error),
                },
                Fallback::CreateDir => Error::DestinationCreateFailed {
                    path,
                    source: Arc::new(error),
                },
            },
        }
    }

    /// Path the error refers to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Error::NotFound { path, .. }
            | Error::PermissionDenied { path, .. }
            | Error::NotADirectory { path, .. }
            | Error::IsADirectory { path, .. }
            | Error::DestinationCreateFailed { path, .. }
            | Error::ReadFailure { path, .. }
            | Error::WriteFailure { path, .. } => Some(path),
            Error::QueueClosedPrematurely
            | Error::InvalidConfiguration(_)
            | Error::Cancelled
            | Error::TaskFailed(_) => None,
        }
    }

    #[must_use]
    pub fn side(&self) -> Option<Side> {
        match self {
            Error::NotFound { side, .. }
            | Error::PermissionDenied { side, .. }
            | Error::NotADirectory { side, .. }
            | Error::IsADirectory { side, .. }
            | Error::ReadFailure { side, .. }
            | Error::WriteFailure { side, .. } => Some(*side),
            Error::DestinationCreateFailed { .. } => Some(Side::Destination),
            Error::QueueClosedPrematurely
            | Error::InvalidConfiguration(_)
            | Error::Cancelled
            | Error::TaskFailed(_) => None,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::TaskFailed(error.to_string())
    }
}
