//! Conductor mode: the mapping store and its RPC endpoint.

use std::sync::Arc;

use pinwheel_conductor::{HttpExecutorClient, InventoryLocator, MappingService};
use pinwheel_core::PinwheelConfig;
use pinwheel_state::StateStore;
use tracing::info;

pub async fn run_conductor(config: PinwheelConfig) -> anyhow::Result<()> {
    info!("pinwheel conductor starting");

    let data_dir = &config.conductor.data_dir;
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("pinwheel.redb");

    // ── State store ──────────────────────────────────────────────
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Mapping service ──────────────────────────────────────────
    let rpc_timeout = config.conductor_rpc_timeout()?;
    let executor = Arc::new(
        HttpExecutorClient::new(rpc_timeout).with_token(config.auth.rpc_token.clone()),
    );
    let locator = Arc::new(InventoryLocator::new(store.clone()));
    let service = Arc::new(MappingService::new(store, executor, locator));
    info!(rpc_timeout_ms = rpc_timeout.as_millis() as u64, "mapping service ready");

    // ── RPC server ───────────────────────────────────────────────
    let router = pinwheel_conductor::build_router(service, config.auth.rpc_token.clone());
    let listener = tokio::net::TcpListener::bind(&config.conductor.listen).await?;
    info!(addr = %listener.local_addr()?, "conductor listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("conductor stopped");
    Ok(())
}
