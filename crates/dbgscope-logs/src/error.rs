//! Error types for the log core.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use dbgscope_capture::CaptureError;

/// Errors raised by the store, filters, views and session.
#[derive(Debug, Error)]
pub enum LogError {
    /// The index is older than the oldest retained message or not yet written.
    #[error("index {index} is outside the retained range [{begin}, {end})")]
    IndexOutOfRange { index: usize, begin: usize, end: usize },

    /// A filter rule pattern did not compile.
    #[error("invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// No view exists at this position.
    #[error("no view at position {0}")]
    UnknownView(usize),

    /// A capture source failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Reading or writing a file failed.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration document could not be parsed.
    #[error("invalid configuration {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The configuration document could not be serialized.
    #[error("cannot serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for log operations.
pub type Result<T> = std::result::Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;
    use dbgscope_types::SourceType;

    #[test]
    fn error_display_messages() {
        let err = LogError::IndexOutOfRange {
            index: 3,
            begin: 10,
            end: 20,
        };
        assert_eq!(err.to_string(), "index 3 is outside the retained range [10, 20)");

        let err = LogError::UnknownView(4);
        assert_eq!(err.to_string(), "no view at position 4");

        let err = LogError::from(CaptureError::Unsupported(SourceType::Agent));
        assert_eq!(err.to_string(), "source type 'agent' is not supported");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogError>();
    }
}
