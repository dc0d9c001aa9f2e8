use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use news_offline::config;
use news_offline::db;
use news_offline::monitor::NetworkMonitor;
use news_offline::replay::HttpReplayer;
use news_offline::sync::SyncCoordinator;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replay every queued offline action against the sync endpoint and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Leave actions that already failed this many times queued without replaying them
    #[arg(long)]
    max_failed_attempts: Option<i32>,

    /// Remove actions that reached --max-failed-attempts instead of keeping them
    #[arg(long, requires = "max_failed_attempts")]
    drop_exhausted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::open(&cfg.database_url()).await?;
    let counts = db::count_pending_actions(&pool).await?;
    info!(
        pending = counts.pending,
        failed = counts.failed,
        last_synced_at = ?db::last_synced_at(&pool).await?,
        "initial queue state"
    );
    if counts.total() == 0 {
        info!("no pending actions, exiting");
        return Ok(());
    }

    let replayer = Arc::new(HttpReplayer::from_config(&cfg)?);
    // A manual sync assumes the operator knows the network is up.
    let monitor = Arc::new(NetworkMonitor::new(true));
    let mut coordinator = SyncCoordinator::new(pool.clone(), replayer, monitor);
    if let Some(max) = args.max_failed_attempts {
        coordinator = coordinator.with_max_attempts(max);
    }

    let report = coordinator.drain().await?;

    if args.drop_exhausted {
        for id in &report.skipped {
            warn!(id, "dropping action that exhausted its attempts");
            db::delete_pending_action(&pool, *id).await?;
        }
    }

    let remaining = db::count_pending_actions(&pool).await?;
    if report.failed.is_empty() {
        info!(
            replayed = report.succeeded.len(),
            remaining = remaining.total(),
            "sync completed"
        );
    } else {
        error!(
            replayed = report.succeeded.len(),
            failed = ?report.failed,
            remaining = remaining.total(),
            "some actions failed and stay queued for the next sync"
        );
    }
    Ok(())
}
