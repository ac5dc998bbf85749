use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use denylist_sync::config::{Config, LogFormat};
use denylist_sync::db::{DenylistStore, MemoryStore, PgStore};
use denylist_sync::engine::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "denylist-sync", version, about = "Stablecoin denylist synchronizer")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Run a single backfill pass on every network and exit
    #[arg(long)]
    once: bool,

    /// Discard stored records and cursors before the first pass
    #[arg(long)]
    full_resync: bool,

    /// Keep state in memory instead of PostgreSQL
    #[arg(long)]
    memory: bool,

    /// Do not start the HTTP API
    #[arg(long)]
    no_api: bool,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}

async fn open_store(config: &Config, in_memory: bool) -> eyre::Result<Arc<dyn DenylistStore>> {
    if in_memory {
        tracing::warn!("Using in-memory store, state is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if config.database.url.is_empty() {
        eyre::bail!("database.url (or DATABASE_URL) is required unless --memory is set");
    }
    let store = PgStore::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;
    tracing::info!("Connected to PostgreSQL, migrations complete");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_logging(config.logging.format);
    tracing::info!(
        networks = config.networks.len(),
        "Configuration loaded from {}",
        cli.config
    );

    let store = open_store(&config, cli.memory).await?;
    let engine = SyncEngine::from_config(&config, store.clone())?;
    let shutdown = CancellationToken::new();

    if cli.once {
        let outcomes = engine.run_backfill_once(cli.full_resync, &shutdown).await;
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.network.as_str())
            .collect();
        if !failed.is_empty() {
            eyre::bail!("Backfill failed for: {}", failed.join(", "));
        }
        tracing::info!("Backfill pass complete");
        return Ok(());
    }

    if cli.full_resync {
        for outcome in engine.run_backfill_once(true, &shutdown).await {
            if let Err(e) = outcome.result {
                tracing::error!(network = %outcome.network, error = %e, "Full resync failed");
            }
        }
    }

    if config.api.enabled && !cli.no_api {
        let host = config.api.host.clone();
        let port = config.api.port;
        let api_store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = denylist_sync::api::serve(api_store, &host, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    let handles = engine.start_live(shutdown.clone());
    tracing::info!("All network drivers started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all drivers...");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("Denylist sync stopped gracefully");
    Ok(())
}
