use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use ffmpeg_mux::{MuxEngine, TranscodeOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Mix audio files into one encoded stream using ffmpeg.
///
/// The encoder binary is taken from FFMPEG_PATH, falling back to `ffmpeg`
/// on the PATH.
#[derive(Parser, Debug)]
#[command(name = "lite-mux")]
#[command(version, about)]
struct Cli {
    /// Input audio files, mixed with equal weight
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short, long)]
    output: PathBuf,

    /// Output codec, as listed by `ffmpeg -codecs`
    #[arg(long, default_value = "libopus")]
    codec: String,

    /// Output container, as listed by `ffmpeg -formats`
    #[arg(long, default_value = "ogg")]
    format: String,

    /// Output bitrate in kbit/s
    #[arg(long, default_value_t = 128)]
    bitrate: u32,

    /// Output volume, 256 = 100%
    #[arg(long, default_value_t = 256)]
    volume: u32,
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_mux", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let code = match run(cli, cancel).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let options = TranscodeOptions {
        codec: cli.codec,
        format: cli.format,
        bitrate: cli.bitrate,
        volume: cli.volume,
        ..TranscodeOptions::standard()
    };
    let engine = MuxEngine::new(options).context("invalid output options")?;

    for input in cli.inputs {
        let name = input.display().to_string();
        let finished = name.clone();
        engine
            .add_source_with(
                input,
                1.0,
                Some(Box::new(move || log::info!("{} finished", finished))),
            )
            .with_context(|| format!("add source {}", name))?;
    }

    let result = match engine.start() {
        Ok(()) => copy_output(&engine, &cli.output, &cancel).await,
        Err(e) => Err(e.into()),
    };

    let stats = engine.stats();
    log::info!(
        "encoded {}kB, {:.2}s of audio at {:.1}kbits/s",
        stats.size,
        stats.duration.as_secs_f64(),
        stats.bitrate
    );
    if let Some(e) = engine.error() {
        log::warn!("mixing error: {}", e);
    }
    engine.cleanup().await;
    result
}

async fn copy_output(
    engine: &MuxEngine,
    path: &Path,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("interrupted");
                break;
            },
            n = engine.read(&mut buf) => n?,
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    file.flush().await?;

    log::info!("wrote {} bytes to {}", written, path.display());
    Ok(())
}
