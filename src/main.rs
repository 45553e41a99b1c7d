use anyhow::{Context, Result};
use clap::Parser;
use solana_sdk::signature::Keypair;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mev_pipeline::config::PipelineConfig;
use mev_pipeline::coordinator::Core;

#[derive(Parser, Debug)]
#[command(name = "mev_pipeline", about = "Real-time MEV detection and bundle submission")]
struct Args {
    /// Path to a JSON config file; defaults plus env overrides when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compose and record bundles without touching the block engine
    #[arg(long)]
    paper: bool,

    /// Log filter, e.g. "info,mev_pipeline=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn load_keypair() -> Result<Keypair> {
    if let Ok(path) = std::env::var("SUBMITTER_KEYPAIR_PATH") {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read keypair file {}", path))?;
        let bytes: Vec<u8> =
            serde_json::from_str(&raw).context("Keypair file is not a JSON byte array")?;
        return Keypair::from_bytes(&bytes).context("Invalid keypair bytes");
    }
    warn!("⚠️  SUBMITTER_KEYPAIR_PATH not set, using an ephemeral keypair");
    Ok(Keypair::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();
    dotenvy::dotenv().ok();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::from_env()?,
    };
    if args.paper {
        config.paper_mode = true;
    }

    info!("🚀 MEV pipeline starting (strategy {:?}, paper={})", config.strategy, config.paper_mode);
    if config.ethical_mode {
        info!("🚫 Ethical mode on: sandwich detection disabled");
    }

    let keypair = Arc::new(load_keypair()?);
    let core = Arc::new(Core::new(config, keypair)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(core.clone().run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("🛑 Interrupt received, shutting down");
    let _ = shutdown_tx.send(true);

    runner.await.context("core worker")??;
    Ok(())
}
