use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    sync::Arc,
};

use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::session::TranscodeSession;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Called once when a source's stream ends.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a source within a mux engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Uuid);

impl SourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Audio handed to a session: anything the encoder can open by name, or a
/// live byte stream piped to its stdin.
pub enum SourceInput {
    File(PathBuf),
    Stream(BoxedReader),
}

impl SourceInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SourceInput::File(path.into())
    }

    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        SourceInput::Stream(Box::new(reader))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            SourceInput::File(_) => "file",
            SourceInput::Stream(_) => "stream",
        }
    }
}

impl fmt::Debug for SourceInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SourceInput::File(path) => f.debug_tuple("File").field(path).finish(),
            SourceInput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<PathBuf> for SourceInput {
    fn from(path: PathBuf) -> Self {
        SourceInput::File(path)
    }
}

impl From<&str> for SourceInput {
    fn from(path: &str) -> Self {
        SourceInput::File(PathBuf::from(path))
    }
}

impl From<String> for SourceInput {
    fn from(path: String) -> Self {
        SourceInput::File(PathBuf::from(path))
    }
}

impl From<BoxedReader> for SourceInput {
    fn from(reader: BoxedReader) -> Self {
        SourceInput::Stream(reader)
    }
}

/// A session being mixed, with its mixing parameters.
pub(crate) struct MuxSource {
    pub(crate) id: SourceId,
    pub(crate) session: Arc<TranscodeSession>,
    pub(crate) volume: f32,
    pub(crate) callback: Option<CompletionCallback>,
}

impl MuxSource {
    pub(crate) fn new(
        session: TranscodeSession,
        volume: f32,
        callback: Option<CompletionCallback>,
    ) -> Self {
        Self {
            id: SourceId::new(),
            session: Arc::new(session),
            volume,
            callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_ids_are_unique() {
        let a = SourceId::new();
        let b = SourceId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_source_input_conversions() {
        assert!(matches!(SourceInput::from("a.mp3"), SourceInput::File(p) if p == PathBuf::from("a.mp3")));
        assert!(matches!(SourceInput::from(String::from("b.ogg")), SourceInput::File(_)));

        let input = SourceInput::stream(std::io::Cursor::new(vec![0u8; 4]));
        assert_eq!(input.kind(), "stream");
        assert_eq!(format!("{:?}", input), "Stream(..)");
    }
}
