//! Publish an image or video for vst-consumer over shared memory or DMA-BUF

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vst_share::discovery::TransportMode;
use vst_share::media::{load_image, open_video};
use vst_share::session::{run_image, run_video, VideoOptions};
use vst_share::utils::{cancel_on_signal, CancelToken};
use vst_share::{Config, CONFIG};

#[derive(Debug, Parser)]
#[command(name = "vst-producer", version, about)]
struct Args {
    #[command(flatten)]
    input: Input,

    /// Transport to publish on
    #[arg(long, value_enum, default_value_t = TransportMode::DmaBuf)]
    mode: TransportMode,

    /// Config file (defaults to ./vst.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame rate for sources that do not declare one
    #[arg(long)]
    fps: Option<f64>,

    /// Restart the video at its end instead of signalling end of stream
    #[arg(long = "loop")]
    looping: bool,
}

#[derive(Debug, clap::Args)]
#[group(required = true, multiple = false)]
struct Input {
    /// Still image to publish
    #[arg(long)]
    image: Option<PathBuf>,

    /// Video file, or a directory of numbered images
    #[arg(long)]
    video: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vst_share=info,vst_producer=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    CONFIG.store(Arc::new(config.clone()));

    let cancel = CancelToken::new();
    cancel_on_signal(cancel.clone())?;

    info!("vst-producer starting in {} mode", args.mode);
    tokio::task::spawn_blocking(move || run(args, &config, &cancel)).await??;

    info!("vst-producer done");
    Ok(())
}

fn run(args: Args, config: &Config, cancel: &CancelToken) -> Result<()> {
    if let Some(path) = args.input.image {
        let frame = load_image(&path)?;
        return run_image(config, args.mode, &frame, cancel);
    }
    let Some(path) = args.input.video else {
        bail!("Either --image or --video is required");
    };

    let source = open_video(&path, args.fps)?;
    let options = VideoOptions {
        fps: args.fps,
        looping: args.looping,
    };
    let published = run_video(config, args.mode, source, options, cancel)?;
    info!("Published {} frames", published);
    Ok(())
}
