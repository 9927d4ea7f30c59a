use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::LazyLock,
};

/// Environment variable overriding the encoder binary.
pub const FFMPEG_PATH_ENV: &str = "FFMPEG_PATH";

pub struct MuxConfig {
    ffmpeg_path: PathBuf,
}

impl MuxConfig {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn from_env() -> Self {
        let path = std::env::var_os(FFMPEG_PATH_ENV)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| OsString::from("ffmpeg"));
        Self::new(path)
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg_path
    }
}

pub fn config() -> &'static MuxConfig {
    static CONFIG: LazyLock<MuxConfig> = LazyLock::new(MuxConfig::from_env);
    &CONFIG
}

/// The external encoder a session launches.
///
/// `leading_args` are passed before the arguments derived from the
/// transcode options, which lets a wrapper (`nice`, `sh -c`, ...) sit in
/// front of the real encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderProgram {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl EncoderProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn leading_args(&self) -> &[String] {
        &self.leading_args
    }
}

impl Default for EncoderProgram {
    fn default() -> Self {
        Self::new(config().ffmpeg_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_program_default_uses_config() {
        let program = EncoderProgram::default();
        assert_eq!(program.program(), config().ffmpeg_path());
        assert!(program.leading_args().is_empty());
    }

    #[test]
    fn test_encoder_program_leading_args() {
        let program = EncoderProgram::new("sh").with_leading_args(["-c", "cat", "ffmpeg"]);
        assert_eq!(program.program(), Path::new("sh"));
        assert_eq!(program.leading_args(), ["-c", "cat", "ffmpeg"]);
    }

    #[test]
    fn test_mux_config_new() {
        let config = MuxConfig::new("/usr/local/bin/ffmpeg");
        assert_eq!(config.ffmpeg_path(), Path::new("/usr/local/bin/ffmpeg"));
    }
}
