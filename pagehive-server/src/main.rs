//! Pagehive realtime server entry point.
//!
//! Reads configuration from the environment (and `.env` when present),
//! opens the page store, applies the `PAGEHIVE_SEED` file if one is set, and
//! serves WebSocket collaboration until Ctrl-C.

use std::sync::Arc;

use pagehive_collab::{
    CollabServer, MemoryStore, RocksConfig, RocksStore, Seed, ServerConfig, ServerError,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let config = ServerConfig::from_env()?;
    log::info!("Starting with {config:?}");

    let seed = config.seed_path.as_deref().map(Seed::from_file).transpose()?;

    let server = match &config.storage_path {
        Some(path) => {
            let store = Arc::new(RocksStore::open(RocksConfig::new(path))?);
            log::info!("Page store opened at {}", store.path().display());
            if let Some(seed) = &seed {
                seed.apply_to_rocks(&store)?;
            }
            CollabServer::with_store(config.clone(), store)
        }
        None => {
            log::warn!("No storage path configured; pages and users live in memory only");
            let store = Arc::new(MemoryStore::new());
            match &seed {
                Some(seed) => {
                    seed.apply_to_memory(&store).await;
                }
                None => log::warn!(
                    "In-memory store has no users; set PAGEHIVE_SEED to provision them"
                ),
            }
            CollabServer::with_store(config.clone(), store)
        }
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    server
        .run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if let Ok(stats) = server.stats().await {
        log::info!(
            "Stopped after {} connection(s), {} rejected, {} persist failure(s)",
            stats.total_connections,
            stats.rejected_connections,
            stats.hub.persist_failures
        );
    }
    Ok(())
}
