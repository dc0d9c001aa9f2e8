use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use news_offline::cache::AssetStore;
use news_offline::config;
use news_offline::db;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print storage statistics, queue depth and cache generations")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also list every queued action
    #[arg(long)]
    queue: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::open(&cfg.database_url()).await?;
    let stats = db::compute_storage_stats(&pool).await?;
    let counts = db::count_pending_actions(&pool).await?;
    let assets = AssetStore::new(pool.clone());

    let mut generations = Vec::new();
    for name in assets.list_generations().await? {
        generations.push(json!({
            "name": name,
            "phase": assets.phase(&name).await?.map(|p| p.as_str()),
            "assets": assets.count_assets(&name).await?,
        }));
    }

    let mut report = json!({
        "storage": stats,
        "estimatedKiB": stats.estimated_kib(),
        "queue": counts,
        "lastSyncedAt": db::last_synced_at(&pool).await?,
        "configuredGeneration": cfg.generation_name(),
        "generations": generations,
    });
    if args.queue {
        report["actions"] = serde_json::to_value(db::list_pending_actions(&pool).await?)?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
