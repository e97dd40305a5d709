//! Hangar scheduler daemon

use anyhow::Context;
use clap::Parser;
use hangar_config::{SchedulerConfig, load_scheduler_config};
use hangar_core::Store;
use hangar_db::{MemoryStore, PgStore, create_pool, run_migrations};
use hangar_scheduler::Scheduler;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hangard")]
#[command(about = "Places runners on nodes", long_about = None)]
struct Args {
    /// Scheduler configuration file (KDL)
    #[arg(long, env = "HANGAR_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection string. Without one, state is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => load_scheduler_config(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    info!(
        heartbeat_timeout = ?config.heartbeat_timeout,
        retry_backoff = ?config.retry_backoff,
        "Loaded scheduler config"
    );

    let store: Arc<dyn Store> = match &args.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("No database configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let scheduler = Scheduler::new(store, &config);
    let ctx = CancellationToken::new();
    scheduler.start(ctx.clone()).await?;
    info!("Scheduler running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    ctx.cancel();
    scheduler.shutdown().await;

    Ok(())
}
