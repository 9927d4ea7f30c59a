//! Progress reporting from the encoder's stderr.
//!
//! ffmpeg run with `-stats` rewrites one status line in place (terminated
//! by `\r`) and writes every other message on its own `\n` terminated line.
//! [`DiagnosticCodec`] splits on both, [`parse_progress`] recognises the
//! status line:
//!
//! ```text
//! size=     512kB time=00:00:02.73 bitrate=1536.0kbits/s speed=5.46x
//! ```

use std::time::Duration;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Snapshot of the most recent progress line.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TranscodeStats {
    /// kB written so far
    pub size: u64,
    /// media time processed
    pub duration: Duration,
    /// kbit/s
    pub bitrate: f32,
    pub speed: f32,
}

/// Parses a progress line, `None` for anything else.
pub fn parse_progress(line: &str) -> Option<TranscodeStats> {
    let line = line.trim();
    if !line.starts_with("size=") {
        return None;
    }

    let size = field(line, "size=")?;
    let size = size
        .strip_suffix("kB")
        .or_else(|| size.strip_suffix("KiB"))?
        .parse::<u64>()
        .ok()?;
    let duration = parse_time(field(line, "time=")?)?;
    let bitrate = field(line, "bitrate=")?
        .strip_suffix("kbits/s")?
        .parse::<f32>()
        .ok()?;
    let speed = field(line, "speed=")?
        .strip_suffix('x')?
        .parse::<f32>()
        .ok()?;

    Some(TranscodeStats {
        size,
        duration,
        bitrate,
        speed,
    })
}

/// Value following `key`, with padding after the `=` skipped.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// `H:M:S.frac`
fn parse_time(value: &str) -> Option<Duration> {
    let mut parts = value.splitn(3, ':');
    let hours = parts.next()?.parse::<u64>().ok()?;
    let minutes = parts.next()?.parse::<u64>().ok()?;
    let seconds = parts.next()?.parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(
        Duration::from_secs(hours * 3600 + minutes * 60)
            + Duration::from_secs_f64(seconds),
    )
}

/// Line splitter for encoder stderr treating `\r` and `\n` as terminators.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiagnosticCodec;

impl Decoder for DiagnosticCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        match src.iter().position(|b| *b == b'\r' || *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let stats =
            parse_progress("size=512kB time=00:01:02.50 bitrate=1536.0kbits/s speed=5.5x")
                .unwrap();
        assert_eq!(stats.size, 512);
        assert_eq!(stats.duration, Duration::from_millis(62_500));
        assert_eq!(stats.bitrate, 1536.0);
        assert_eq!(stats.speed, 5.5);
    }

    #[test]
    fn test_parse_progress_padded_line() {
        let stats = parse_progress(
            "size=     768KiB time=01:00:00.00 bitrate= 320.0kbits/s speed=  12x",
        )
        .unwrap();
        assert_eq!(stats.size, 768);
        assert_eq!(stats.duration, Duration::from_secs(3600));
        assert_eq!(stats.bitrate, 320.0);
        assert_eq!(stats.speed, 12.0);
    }

    #[test]
    fn test_parse_progress_ignores_other_lines() {
        assert!(parse_progress("Input #0, mp3, from 'song.mp3':").is_none());
        assert!(parse_progress("Lsize=512kB time=00:00:01.00 bitrate=1.0kbits/s speed=1x").is_none());
        assert!(parse_progress("size=N/A time=00:00:01.00 bitrate=N/A speed=1x").is_none());
        assert!(parse_progress("size=1kB time=N/A bitrate=1.0kbits/s speed=1x").is_none());
        assert!(parse_progress("").is_none());
    }

    #[test]
    fn test_diagnostic_codec_splits_cr_and_lf() {
        let mut codec = DiagnosticCodec;
        let mut src = BytesMut::from(&b"Stream mapping:\nsize=1kB\rsize=2kB\rtail"[..]);

        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("Stream mapping:"));
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("size=1kB"));
        assert_eq!(codec.decode(&mut src).unwrap().as_deref(), Some("size=2kB"));
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut src).unwrap().as_deref(), Some("tail"));
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_default_stats_are_zero() {
        let stats = TranscodeStats::default();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.duration, Duration::ZERO);
        assert_eq!(stats.bitrate, 0.0);
        assert_eq!(stats.speed, 0.0);
    }
}
