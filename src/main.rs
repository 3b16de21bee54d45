//! `cinesyncd` — the replication daemon.
//!
//! Invocation runs the loop directly; there are no subcommands. All
//! configuration is environment-sourced (a `.env` file next to the process
//! is honored). Exits non-zero if another instance already holds the
//! singleton lock or if startup wiring (settings, connections, index
//! creation) fails.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cinesync::backoff::{Backoff, Shutdown};
use cinesync::checkpoint::{CheckpointStore, RedisBackend};
use cinesync::config;
use cinesync::db;
use cinesync::elastic::{ElasticSink, Sink};
use cinesync::etl::Etl;
use cinesync::singleton;
use cinesync::source::PgCatalog;

#[derive(Parser)]
#[command(
    name = "cinesyncd",
    about = "Replicates the film catalog from PostgreSQL into Elasticsearch",
    version
)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    let _cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let lock_path = singleton::default_lock_path();
    let mut lock = singleton::open(&lock_path)?;
    let _guard = match singleton::try_exclusive(&mut lock, &lock_path) {
        Ok(guard) => guard,
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    };

    let settings = config::load_settings()?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing in-flight writes");
                shutdown.trigger();
            }
        });
    }

    let policy = Backoff::default();

    let pool = db::connect(&settings.postgres).await?;
    let catalog = Arc::new(PgCatalog::new(pool, policy, shutdown.clone()));

    let sink = Arc::new(ElasticSink::new(&settings.elastic, policy, shutdown.clone())?);
    sink.ensure_indices().await?;

    let backend = RedisBackend::connect(&settings.redis.url()).await?;
    let checkpoints = CheckpointStore::new(Box::new(backend), policy, shutdown.clone());

    info!("starting replication loop");
    let etl = Etl::new(catalog, sink, checkpoints, &settings, shutdown);
    etl.run().await
}
