//! chime - a durable cron scheduler that fires HTTP callbacks.
//!
//! Configuration comes from the environment (see `Config`); the flags
//! below override it for local runs.

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use chime::api::{self, ApiState};
use chime::config::Config;
use chime::scheduler::Scheduler;
use chime::store::{JobStore, MemoryStore, SqliteStore};

/// chime - a durable cron scheduler for HTTP callbacks
#[derive(Parser)]
#[command(name = "chime")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP API to (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database URL or path (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = Some(database_url);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
        )
        .init();

    match &config.database_url {
        Some(database_url) => {
            info!(database_url = %database_url, "using sqlite store");
            let store = SqliteStore::connect(database_url).await?;
            serve(Arc::new(store), config).await
        }
        None => {
            info!("no DATABASE_URL configured, using in-memory store");
            serve(Arc::new(MemoryStore::new()), config).await
        }
    }
}

/// Start the scheduler and the API server over the given store.
async fn serve<S: JobStore + 'static>(
    store: Arc<S>,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::with_store(Arc::clone(&store), config.scheduler_config());
    let (handle, scheduler_task) = scheduler.start()?;

    let state = ApiState {
        handle: handle.clone(),
        store,
    };
    let router = api::router(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "api listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "api server error");
        }
    });

    info!("press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down, draining in-flight attempts");
    handle.shutdown(true).await?;
    let _ = scheduler_task.await;
    server.abort();

    info!("goodbye");
    Ok(())
}
