use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use strider_common::config::load_config;
use strider_crawler::{build_fetcher, Crawler};

/// Reconnaissance crawler: seeds in, a deterministic artifact tree out.
#[derive(Parser, Debug)]
#[command(name = "strider", version)]
struct Args {
    /// Path to the TOML configuration file. Falls back to $STRIDER_CONFIG.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("strider=info,strider_crawler=info,strider_common=info")),
        )
        .init();

    match run().await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Strider run failed");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config_path = match args.config.or_else(|| {
        std::env::var("STRIDER_CONFIG").ok().map(PathBuf::from)
    }) {
        Some(path) => path,
        None => bail!("no config file: pass a path or set STRIDER_CONFIG"),
    };

    let config = load_config(&config_path)?;
    info!(config = %config_path.display(), site = config.primary_target(), "Strider starting");

    let fetcher = build_fetcher(&config)?;
    let mut crawler = Crawler::new(config, fetcher)?;

    // One Ctrl-C requests a clean stop; the orchestrator finishes the
    // current iteration, flushes and checkpoints.
    let cancel = crawler.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current iteration");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let stats = crawler.run().await?;
    info!("Crawl complete. {stats}");
    Ok(())
}
