use std::fmt::{Display, Formatter};

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub use bytes::Bytes;

pub type FrameSender = tokio::sync::mpsc::Sender<Frame>;
pub type FrameReceiver = tokio::sync::mpsc::Receiver<Frame>;

/// One unit of audio read from an encoder's stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Frame {{ data: {} }}", self.data.len())
    }
}

/// Splits encoder output into frames of `frame_bytes` each. Whatever is
/// left at end of stream becomes one final short frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(1),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < self.frame_bytes {
            src.reserve(self.frame_bytes - src.len());
            return Ok(None);
        }
        Ok(Some(Frame::new(src.split_to(self.frame_bytes).freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(Frame::new(src.split().freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_codec_splits_fixed_frames() {
        let mut codec = FrameCodec::new(4);
        let mut src = BytesMut::from(&[1u8, 2, 3, 4, 5, 6][..]);

        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.data(), &[1, 2, 3, 4]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 2);
    }

    #[test]
    fn test_frame_codec_flushes_tail_at_eof() {
        let mut codec = FrameCodec::new(4);
        let mut src = BytesMut::from(&[9u8, 8, 7][..]);

        let tail = codec.decode_eof(&mut src).unwrap().unwrap();
        assert_eq!(tail.data(), &[9, 8, 7]);
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_frame_codec_never_yields_empty_frame() {
        let mut codec = FrameCodec::new(4);
        let mut src = BytesMut::new();
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::new(vec![0u8; 3840]);
        assert_eq!(frame.to_string(), "Frame { data: 3840 }");
        assert_eq!(frame.len(), 3840);
        assert!(!frame.is_empty());
    }
}
