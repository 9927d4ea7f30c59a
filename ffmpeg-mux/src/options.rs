use std::{fmt, path::Path, time::Duration};

use crate::error::{MuxError, Result};

/// Samples per channel in a 20ms frame at 48kHz.
const SAMPLES_PER_20MS: u32 = 960;

/// Bytes per sample of the signed 16-bit PCM the engine mixes.
pub const SAMPLE_BYTES: usize = 2;

pub const MAX_VOLUME: u32 = 512;

pub const MAX_CHANNELS: u32 = 255;

/// Deepest frame queue a session will allocate.
pub const MAX_BUFFERED_FRAMES: usize = 1 << 16;

/// Application profile for encoders that support one (opus).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudioApplication {
    /// Favor improved speech intelligibility
    Voip,
    /// Favor faithfulness to the input
    Audio,
    /// Restrict to only the lowest delay modes
    LowDelay,
}

impl AudioApplication {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioApplication::Voip => "voip",
            AudioApplication::Audio => "audio",
            AudioApplication::LowDelay => "lowdelay",
        }
    }
}

impl fmt::Display for AudioApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AudioApplication {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "voip" => Ok(AudioApplication::Voip),
            "audio" => Ok(AudioApplication::Audio),
            "lowdelay" => Ok(AudioApplication::LowDelay),
            other => Err(MuxError::invalid_option(
                "application",
                format!("unknown audio application {:?}", other),
            )),
        }
    }
}

/// Encoder settings for one transcode session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TranscodeOptions {
    // run "ffmpeg -codecs" for what the installed encoder supports
    pub codec: String,
    // run "ffmpeg -formats"
    pub format: String,
    // 0-512, 256 = 100%
    pub volume: u32,
    pub channels: u32,
    // e.g. 48000
    pub sample_rate: u32,
    // 20, 40 or 60 ms
    pub frame_duration: u32,
    // kbit/s
    pub bitrate: u32,
    // expected packet loss percentage, 0-100
    pub packet_loss: u32,
    pub application: Option<AudioApplication>,
    // 0-10
    pub compression_level: u32,
    // 0 = automatic
    pub threads: u32,
    // ffmpeg audio filter graph, None = no filters
    pub audio_filter: Option<String>,
    // depth of the frame queue
    pub buffered_frames: usize,
    pub vbr: bool,
}

impl TranscodeOptions {
    /// General purpose defaults.
    pub fn standard() -> Self {
        Self {
            codec: "pcm_s16le".to_string(),
            format: "s16le".to_string(),
            volume: 256,
            channels: 2,
            sample_rate: 48000,
            frame_duration: 20,
            bitrate: 128,
            packet_loss: 1,
            application: Some(AudioApplication::Audio),
            compression_level: 10,
            threads: 0,
            audio_filter: None,
            buffered_frames: 100,
            vbr: true,
        }
    }

    /// Signed 16-bit little endian PCM, the profile every mux source is
    /// decoded with.
    pub fn raw() -> Self {
        Self {
            codec: "pcm_s16le".to_string(),
            format: "s16le".to_string(),
            volume: 256,
            channels: 2,
            sample_rate: 48000,
            frame_duration: 20,
            bitrate: 128,
            packet_loss: 0,
            application: None,
            compression_level: 0,
            threads: 0,
            audio_filter: None,
            buffered_frames: 100,
            vbr: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.codec.is_empty() {
            return Err(MuxError::invalid_option("codec", "must not be empty"));
        }
        if self.format.is_empty() {
            return Err(MuxError::invalid_option("format", "must not be empty"));
        }
        if self.volume > MAX_VOLUME {
            return Err(MuxError::invalid_option("volume", "out of bounds (0-512)"));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(MuxError::invalid_option("channels", "out of bounds (1-255)"));
        }
        if self.sample_rate == 0 {
            return Err(MuxError::invalid_option("sample_rate", "must be at least 1"));
        }
        if !matches!(self.frame_duration, 20 | 40 | 60) {
            return Err(MuxError::invalid_option(
                "frame_duration",
                "invalid frame duration (20, 40, 60)",
            ));
        }
        if self.packet_loss > 100 {
            return Err(MuxError::invalid_option(
                "packet_loss",
                "invalid packet loss percentage (0-100)",
            ));
        }
        if self.compression_level > 10 {
            return Err(MuxError::invalid_option(
                "compression_level",
                "out of bounds (0-10)",
            ));
        }
        if self.buffered_frames == 0 || self.buffered_frames > MAX_BUFFERED_FRAMES {
            return Err(MuxError::invalid_option(
                "buffered_frames",
                "out of bounds (1-65536)",
            ));
        }
        Ok(())
    }

    /// Samples (all channels) in one frame.
    pub fn pcm_frame_len(&self) -> usize {
        (SAMPLES_PER_20MS as usize)
            .saturating_mul(self.channels as usize)
            .saturating_mul((self.frame_duration / 20) as usize)
    }

    /// Bytes in one frame read from the encoder output.
    pub fn frame_bytes(&self) -> usize {
        self.pcm_frame_len().saturating_mul(SAMPLE_BYTES)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration as u64)
    }

    /// Encoder argument list for the given input.
    pub fn to_args(&self, input: &InputArg<'_>) -> Vec<String> {
        let mut args = vec!["-stats".to_string()];

        match input {
            InputArg::File(path) => {
                args.push("-i".to_string());
                args.push(path.to_string_lossy().into_owned());
            }
            InputArg::Pipe(raw) => {
                if let Some(raw) = raw {
                    args.extend([
                        "-f".to_string(),
                        "s16le".to_string(),
                        "-ar".to_string(),
                        raw.sample_rate.to_string(),
                        "-ac".to_string(),
                        raw.channels.to_string(),
                    ]);
                }
                args.push("-i".to_string());
                args.push("pipe:0".to_string());
            }
        }

        args.extend([
            "-map".to_string(),
            "0:a".to_string(),
            "-acodec".to_string(),
            self.codec.clone(),
            "-f".to_string(),
            self.format.clone(),
            "-vbr".to_string(),
            if self.vbr { "on" } else { "off" }.to_string(),
            "-vol".to_string(),
            self.volume.to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "-b:a".to_string(),
            (self.bitrate as u64 * 1000).to_string(),
            "-frame_duration".to_string(),
            self.frame_duration.to_string(),
            "-threads".to_string(),
            self.threads.to_string(),
        ]);

        if self.compression_level > 0 {
            args.push("-compression_level".to_string());
            args.push(self.compression_level.to_string());
        }
        if let Some(application) = self.application {
            args.push("-application".to_string());
            args.push(application.to_string());
        }
        if self.packet_loss > 0 {
            args.push("-packet_loss".to_string());
            args.push(self.packet_loss.to_string());
        }
        if let Some(filter) = self.audio_filter.as_deref().filter(|f| !f.is_empty()) {
            args.push("-af".to_string());
            args.push(filter.to_string());
        }

        args.push("pipe:1".to_string());
        args
    }
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self::standard()
    }
}

/// Layout of headerless s16le PCM fed on stdin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawPcmFormat {
    pub sample_rate: u32,
    pub channels: u32,
}

impl From<&TranscodeOptions> for RawPcmFormat {
    fn from(options: &TranscodeOptions) -> Self {
        Self {
            sample_rate: options.sample_rate,
            channels: options.channels,
        }
    }
}

/// Where the encoder reads its input from.
#[derive(Clone, Copy, Debug)]
pub enum InputArg<'a> {
    File(&'a Path),
    /// stdin, optionally declared as raw PCM
    Pipe(Option<RawPcmFormat>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        position(args, flag).map(|i| args[i + 1].as_str())
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(TranscodeOptions::standard().validate().is_ok());
        assert!(TranscodeOptions::raw().validate().is_ok());
        assert_eq!(TranscodeOptions::default(), TranscodeOptions::standard());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases: Vec<(&str, TranscodeOptions)> = vec![
            ("volume", TranscodeOptions { volume: 513, ..TranscodeOptions::raw() }),
            ("frame_duration", TranscodeOptions { frame_duration: 30, ..TranscodeOptions::raw() }),
            ("packet_loss", TranscodeOptions { packet_loss: 101, ..TranscodeOptions::raw() }),
            ("compression_level", TranscodeOptions { compression_level: 11, ..TranscodeOptions::raw() }),
            ("buffered_frames", TranscodeOptions { buffered_frames: 0, ..TranscodeOptions::raw() }),
            ("channels", TranscodeOptions { channels: 0, ..TranscodeOptions::raw() }),
            ("channels", TranscodeOptions { channels: 5_000_000, ..TranscodeOptions::raw() }),
            ("buffered_frames", TranscodeOptions { buffered_frames: usize::MAX, ..TranscodeOptions::raw() }),
            ("sample_rate", TranscodeOptions { sample_rate: 0, ..TranscodeOptions::raw() }),
            ("codec", TranscodeOptions { codec: String::new(), ..TranscodeOptions::raw() }),
        ];

        for (expected, options) in cases {
            match options.validate() {
                Err(MuxError::InvalidOption { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected {} to be rejected, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_validate_accepts_bounds() {
        let options = TranscodeOptions {
            volume: 512,
            frame_duration: 60,
            packet_loss: 100,
            compression_level: 10,
            buffered_frames: 1,
            ..TranscodeOptions::raw()
        };
        assert!(options.validate().is_ok());

        let options = TranscodeOptions {
            channels: MAX_CHANNELS,
            frame_duration: 60,
            buffered_frames: MAX_BUFFERED_FRAMES,
            ..TranscodeOptions::raw()
        };
        assert!(options.validate().is_ok());
        assert_eq!(options.frame_bytes(), 960 * 255 * 3 * 2);
    }

    #[test]
    fn test_pcm_frame_len() {
        let mut options = TranscodeOptions::raw();
        assert_eq!(options.pcm_frame_len(), 1920);
        assert_eq!(options.frame_bytes(), 3840);

        options.frame_duration = 60;
        options.channels = 1;
        assert_eq!(options.pcm_frame_len(), 2880);
        assert_eq!(options.frame_duration(), Duration::from_millis(60));
    }

    #[test]
    fn test_application_parse() {
        assert_eq!("voip".parse::<AudioApplication>().ok(), Some(AudioApplication::Voip));
        assert_eq!(
            "lowdelay".parse::<AudioApplication>().ok(),
            Some(AudioApplication::LowDelay)
        );
        assert!("music".parse::<AudioApplication>().is_err());
    }

    #[test]
    fn test_args_file_input() {
        let options = TranscodeOptions::raw();
        let args = options.to_args(&InputArg::File(Path::new("song.flac")));

        assert_eq!(args.first().map(String::as_str), Some("-stats"));
        assert_eq!(value_of(&args, "-i"), Some("song.flac"));
        assert_eq!(value_of(&args, "-map"), Some("0:a"));
        assert_eq!(value_of(&args, "-acodec"), Some("pcm_s16le"));
        assert_eq!(value_of(&args, "-vbr"), Some("off"));
        assert_eq!(value_of(&args, "-vol"), Some("256"));
        assert_eq!(value_of(&args, "-ar"), Some("48000"));
        assert_eq!(value_of(&args, "-ac"), Some("2"));
        assert_eq!(value_of(&args, "-b:a"), Some("128000"));
        assert_eq!(value_of(&args, "-frame_duration"), Some("20"));
        assert_eq!(value_of(&args, "-threads"), Some("0"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));

        // zero / unset fields are left out
        assert!(position(&args, "-compression_level").is_none());
        assert!(position(&args, "-application").is_none());
        assert!(position(&args, "-packet_loss").is_none());
        assert!(position(&args, "-af").is_none());
    }

    #[test]
    fn test_args_optional_flags() {
        let options = TranscodeOptions {
            codec: "libopus".to_string(),
            format: "ogg".to_string(),
            audio_filter: Some("loudnorm".to_string()),
            threads: 4,
            ..TranscodeOptions::standard()
        };
        let args = options.to_args(&InputArg::Pipe(None));

        assert_eq!(value_of(&args, "-i"), Some("pipe:0"));
        assert_eq!(value_of(&args, "-f"), Some("ogg"));
        assert_eq!(value_of(&args, "-vbr"), Some("on"));
        assert_eq!(value_of(&args, "-compression_level"), Some("10"));
        assert_eq!(value_of(&args, "-application"), Some("audio"));
        assert_eq!(value_of(&args, "-packet_loss"), Some("1"));
        assert_eq!(value_of(&args, "-af"), Some("loudnorm"));
        assert_eq!(value_of(&args, "-threads"), Some("4"));
    }

    #[test]
    fn test_args_empty_filter_is_skipped() {
        let options = TranscodeOptions {
            audio_filter: Some(String::new()),
            ..TranscodeOptions::raw()
        };
        let args = options.to_args(&InputArg::Pipe(None));
        assert!(position(&args, "-af").is_none());
    }

    #[test]
    fn test_args_raw_pipe_input_declares_format() {
        let options = TranscodeOptions::raw();
        let raw = RawPcmFormat::from(&options);
        let args = options.to_args(&InputArg::Pipe(Some(raw)));

        let input = position(&args, "-i").unwrap();
        assert_eq!(&args[1..input], ["-f", "s16le", "-ar", "48000", "-ac", "2"]);
        assert_eq!(args[input + 1], "pipe:0");
    }

    #[test]
    fn test_args_deterministic() {
        let options = TranscodeOptions::standard();
        let input = InputArg::File(Path::new("a.mp3"));
        assert_eq!(options.to_args(&input), options.to_args(&input));
    }
}
