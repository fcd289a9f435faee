use anyhow::Result;
use catalog_sync::orchestrator::Orchestrator;
use catalog_sync::progress::ProgressChannel;
use catalog_sync::{config, db};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/catalog-sync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let progress = Arc::new(ProgressChannel::new(cfg.pipeline.progress_buffer as usize));
    let orchestrator = Arc::new(Orchestrator::new(
        pool,
        progress,
        cfg.pipeline.chunk_size as u64,
        cfg.pipeline.max_chunk_retries,
        cfg.app.max_backoff_seconds,
    ));

    let poll_interval = Duration::from_millis(cfg.app.poll_interval_ms);
    let worker = Arc::clone(&orchestrator).spawn_worker(poll_interval);

    info!("catalog pipeline worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    worker.abort();

    Ok(())
}
