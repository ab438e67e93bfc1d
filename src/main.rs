use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

use klip_lib::{commands, logging, ArboardClipboard, Config, HistoryCore, TesseractEngine};

/// Headless clipboard history daemon.
#[derive(Debug, Parser)]
#[command(name = "klipd", version, about = "Records clipboard history into a local database")]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding the database and image files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Clipboard poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Seconds between retention sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Record images as well as text
    #[arg(long)]
    capture_images: bool,

    /// Run one retention sweep, print the report and exit
    #[arg(long)]
    sweep_once: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms.max(50);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval_secs = secs.max(1);
        }
        if self.capture_images {
            config.capture_images = true;
        }
    }

    fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_level());

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    args.apply(&mut config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "Starting klipd"
    );

    if args.sweep_once {
        let engine = Arc::new(TesseractEngine::new(config.ocr_command.clone()));
        let core = HistoryCore::open(config, Box::new(ArboardClipboard), engine, Handle::current())
            .context("failed to open clip history")?;
        let report = commands::run_retention_sweep(&core)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let core = HistoryCore::launch(config, Handle::current())?;

    let changes = commands::subscribe(&core);
    std::thread::Builder::new()
        .name("klip-events".to_string())
        .spawn(move || {
            while changes.recv() {
                debug!("History changed");
            }
        })
        .context("failed to spawn event logger")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    core.shutdown();
    Ok(())
}
