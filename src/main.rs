use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;

use mailhub::{AppConfig, AppContext};

/// How often the keep-alive watchdog scans for stale groups.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Parser)]
#[command(name = "mailhub", about = "Multi-tenant mailbox aggregation and sync service")]
struct Cli {
    /// Path to the sqlite store file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Broker connection URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// Disable the keep-alive watchdog.
    #[arg(long)]
    no_watchdog: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(db_path) = cli.db_path {
        config.store_path = db_path;
    }
    if let Some(redis_url) = cli.redis_url {
        config.broker_url = redis_url;
    }

    log::info!("starting mailhub");

    let ctx = match AppContext::init(config, None).await {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    // The writer daemon gets its own task for the life of the process.
    let writer = ctx.writer_daemon();
    tokio::spawn(async move {
        writer.run().await;
    });

    if !cli.no_watchdog {
        let watchdog = ctx.maintenance_watchdog(WATCHDOG_INTERVAL);
        tokio::spawn(async move {
            watchdog.run().await;
        });
    }

    log::info!(
        "mailhub ready (store {}, {} workers)",
        ctx.config.store_path.display(),
        ctx.config.worker_pool_size
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(e) => log::error!("failed to listen for shutdown signal: {}", e),
    }

    ctx.store.close().await;
    log::info!("mailhub stopped");
}
