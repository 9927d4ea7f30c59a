//! Error types shared by sessions and the mux engine.

use std::{process::ExitStatus, sync::Arc};

use thiserror::Error;

use crate::source::SourceId;

/// Errors raised by transcode sessions, frame buffers and the mux engine.
///
/// Cloneable so the first terminal error can be stored once and handed out
/// to every caller of `error()`.
#[derive(Error, Debug, Clone)]
pub enum MuxError {
    /// An option value outside its documented range.
    #[error("invalid option `{field}`: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    /// The encoder process could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The encoder exited with a failure status it was not asked to.
    #[error("encoder exited with {0}")]
    ProcessFailed(ExitStatus),

    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// A mux source failed; the engine dropped it and kept mixing.
    #[error("source {id} failed: {error}")]
    Source { id: SourceId, error: Box<MuxError> },

    #[error("invalid source type")]
    InvalidSourceType,

    #[error("source {0} not found")]
    SourceNotFound(SourceId),

    #[error("cannot read into empty buffer")]
    EmptyReadBuffer,

    #[error("cannot write from empty buffer")]
    EmptyWriteBuffer,

    #[error("stream closed")]
    Closed,

    #[error("mux engine not started")]
    NotStarted,
}

impl MuxError {
    pub(crate) fn invalid_option(field: &'static str, reason: impl Into<String>) -> Self {
        MuxError::InvalidOption {
            field,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        MuxError::Io(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_display() {
        let err = MuxError::invalid_option("volume", "out of bounds (0-512)");
        assert_eq!(err.to_string(), "invalid option `volume`: out of bounds (0-512)");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = MuxError::from(io_err);
        assert!(matches!(err, MuxError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_source_error_wraps_cause() {
        let id = SourceId::new();
        let err = MuxError::Source {
            id,
            error: Box::new(MuxError::Closed),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.ends_with("stream closed"));
    }

    #[test]
    fn test_clone_keeps_io_source() {
        let err = MuxError::Spawn {
            program: "ffmpeg".to_string(),
            source: Arc::new(std::io::Error::new(std::io::ErrorKind::NotFound, "missing")),
        };
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(std::error::Error::source(&cloned).is_some());
    }
}
