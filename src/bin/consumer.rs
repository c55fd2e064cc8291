//! Find a running vst-producer and display what it shares

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vst_share::display::{FrameSink, PngSink, StatsSink};
use vst_share::session::{run_consumer, ConsumerSession};
use vst_share::utils::{cancel_on_signal, CancelToken};
use vst_share::{Config, CONFIG};

#[derive(Debug, Parser)]
#[command(name = "vst-consumer", version, about)]
struct Args {
    /// Config file (defaults to ./vst.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the last received frame to this PNG
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Show frames in a window (needs the sdl-display feature)
    #[arg(long)]
    window: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vst_share=info,vst_consumer=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    CONFIG.store(Arc::new(config.clone()));

    let cancel = CancelToken::new();
    cancel_on_signal(cancel.clone())?;

    tokio::task::spawn_blocking(move || run(args, &config, &cancel)).await??;

    info!("vst-consumer done");
    Ok(())
}

fn run(args: Args, config: &Config, cancel: &CancelToken) -> Result<()> {
    let resource = ConsumerSession::discover(config).wrap_err("Discovery failed")?;
    info!(
        "Using {} resource {} ({}x{})",
        resource.kind,
        resource.path.display(),
        resource.width,
        resource.height
    );

    let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(StatsSink::new())];
    if let Some(path) = args.dump {
        sinks.push(Box::new(PngSink::new(path)));
    }
    if args.window {
        sinks.push(window_sink(config, resource.width, resource.height)?);
    }

    let mut session = ConsumerSession::join(config, resource, cancel)
        .wrap_err("Failed to attach to producer")?;
    let summary = run_consumer(config, &mut session, &mut sinks, cancel, args.max_frames)?;
    session.close();

    info!("{:?}", summary);
    Ok(())
}

#[cfg(feature = "sdl-display")]
fn window_sink(config: &Config, width: u32, height: u32) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(vst_share::display::Sdl2Sink::new(
        &config.display.title,
        width,
        height,
    )?))
}

#[cfg(not(feature = "sdl-display"))]
fn window_sink(_config: &Config, _width: u32, _height: u32) -> Result<Box<dyn FrameSink>> {
    Err(color_eyre::eyre::eyre!(
        "--window needs vst-consumer built with the sdl-display feature"
    ))
}
