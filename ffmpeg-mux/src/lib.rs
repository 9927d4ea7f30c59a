//! Audio transcoding and mixing on top of an external `ffmpeg` process.
//!
//! A [`TranscodeSession`] runs one encoder and hands out its output as
//! fixed-size PCM frames or as a byte stream. A [`MuxEngine`] decodes any
//! number of sources, averages them sample by sample and re-encodes the
//! result through one more session.

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod mixer;
pub mod options;
pub mod session;
pub mod source;
pub mod stats;

pub use buffer::FrameBuffer;
pub use config::{EncoderProgram, config};
pub use error::{MuxError, Result};
pub use frame::Frame;
pub use mixer::MuxEngine;
pub use options::{AudioApplication, TranscodeOptions};
pub use session::{SessionPhase, TranscodeSession};
pub use source::{SourceId, SourceInput};
pub use stats::TranscodeStats;
