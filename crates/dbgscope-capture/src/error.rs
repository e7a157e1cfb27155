//! Error types for capture sources.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use dbgscope_types::SourceType;

/// Errors raised while creating or running capture sources.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Another reader already owns this capture resource.
    #[error("{name} already exists; another debug output reader is running")]
    DuplicateInstance { name: String },

    /// The resource exists but the caller may not open it.
    #[error("insufficient privileges to open {name}")]
    PermissionDenied { name: String },

    /// No reader is listening on the shared-memory buffer.
    #[error("no debug output reader is listening on {name}")]
    NoListener { name: String },

    /// The source type has no implementation on this platform.
    #[error("source type '{0}' is not supported")]
    Unsupported(SourceType),

    /// An operating system call failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reading or writing a file failed.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A saved log file is malformed.
    #[error("invalid log file: {0}")]
    Format(String),

    /// A record could not be encoded or decoded.
    #[error("record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    /// The job dispatcher no longer accepts work.
    #[error("job dispatcher has been stopped")]
    DispatcherStopped,

    /// `flush` was called from the dispatcher's own thread.
    #[error("cannot flush a job dispatcher from its own thread")]
    FlushFromDispatcher,
}

impl CaptureError {
    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        Self::Os { op, source }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
