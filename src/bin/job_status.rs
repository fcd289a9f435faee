use anyhow::{anyhow, Result};
use catalog_sync::{config, db};
use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(about = "Print a job record and its failure list.")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Brand the job belongs to
    #[arg(long)]
    brand: i64,

    /// Job id
    #[arg(long)]
    job: Uuid,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/catalog-sync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;

    let job = db::fetch_job_scoped(&pool, args.brand, args.job)
        .await?
        .ok_or_else(|| anyhow!("job {} not found for brand {}", args.job, args.brand))?;

    println!(
        "{} {} {} processed={}/{} created={} updated={} failed={}",
        job.id,
        job.kind.as_str(),
        job.status.as_str(),
        job.processed,
        job.total,
        job.created,
        job.updated,
        job.failed
    );
    if !job.message.is_empty() {
        println!("message: {}", job.message);
    }

    for failure in db::list_failures(&pool, args.job).await? {
        println!(
            "  row {} [{}] {} ({}): {}",
            failure.row_index,
            failure.severity.as_str(),
            failure.column,
            failure.kind.as_str(),
            failure.message
        );
    }

    Ok(())
}
