//! `lakesync` — thin process entrypoint.
//!
//! Wires configuration, logging, the catalog connection, and the cycle
//! scheduler (C9) together, then runs every configured engine's polling
//! loop until SIGINT/SIGTERM. CLI parsing, process supervision, and exit
//! codes are explicitly out of spec.md's scope (§1); this surface exists
//! only because a runnable crate needs *some* entrypoint, kept as thin as
//! the teacher's sibling relay binary's own `main.rs`.

use std::path::PathBuf;

use clap::Parser;
use tokio_postgres::NoTls;
use tracing_subscriber::EnvFilter;

use lakesync::catalog::{CatalogStore, DbEngine};
use lakesync::config::Config;
use lakesync::scheduler::CycleScheduler;

/// Multi-source data-lake synchronizer.
#[derive(Parser, Debug)]
#[command(name = "lakesync", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "LAKESYNC_CONFIG", default_value = "lakesync.toml")]
    config: PathBuf,

    /// Source engines to run this cycle scheduler for, e.g. `--engine
    /// MariaDB --engine PostgreSQL`. Defaults to all five.
    #[arg(long = "engine", value_name = "ENGINE")]
    engines: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let engines = if args.engines.is_empty() {
        vec![
            DbEngine::MariaDb,
            DbEngine::Mssql,
            DbEngine::Oracle,
            DbEngine::Postgres,
            DbEngine::MongoDb,
        ]
    } else {
        args.engines
            .iter()
            .map(|s| DbEngine::parse(s))
            .collect::<Result<Vec<_>, _>>()?
    };

    let (catalog_client, catalog_connection) = tokio_postgres::connect(&config.catalog_dsn, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = catalog_connection.await {
            tracing::error!(error = %e, "catalog connection terminated");
        }
    });

    let scheduler = CycleScheduler::new(CatalogStore::new(catalog_client), config);

    tracing::info!(engines = ?engines.iter().map(DbEngine::as_str).collect::<Vec<_>>(), "starting cycle scheduler");

    tokio::select! {
        _ = scheduler.run(&engines) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    Ok(())
}
