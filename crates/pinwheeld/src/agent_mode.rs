//! Agent mode: runs on each compute host.
//!
//! 1. Connects to the hypervisor and reads the host CPU count
//! 2. Starts the resource tracker loop
//! 3. Starts the event dispatcher on the notification queue
//! 4. Serves the apply RPC and notification intake
//! 5. On ctrl-c, stops the loops and drains the server

use std::sync::Arc;

use pinwheel_agent::{
    AgentState, EventDispatcher, HostResourceTracker, HttpConductorClient, PinExecutor,
};
use pinwheel_core::PinwheelConfig;
use pinwheel_core::config::HypervisorKind;
use pinwheel_hypervisor::{Hypervisor, SimulatedHypervisor, VirshHypervisor};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Shape of the in-memory host used by `hypervisor = "simulated"`.
const SIMULATED_CELLS: u32 = 2;
const SIMULATED_CPUS_PER_CELL: u32 = 4;

pub async fn run_agent(config: PinwheelConfig) -> anyhow::Result<()> {
    info!("pinwheel agent starting");
    if config.agent.advertises_wildcard() {
        warn!(
            advertise = %config.agent.advertise_addr(),
            "agent advertises a wildcard address; set agent.advertise so the conductor can reach it"
        );
    }

    // ── Hypervisor ───────────────────────────────────────────────
    let hypervisor: Arc<dyn Hypervisor> = match config.agent.hypervisor {
        HypervisorKind::Virsh => Arc::new(
            VirshHypervisor::new(config.agent.virsh_uri.clone())
                .with_command_timeout(config.virsh_timeout()?),
        ),
        HypervisorKind::Simulated => {
            let name = config.host.clone().unwrap_or_else(|| "simulated".to_string());
            Arc::new(SimulatedHypervisor::new(name, SIMULATED_CELLS, SIMULATED_CPUS_PER_CELL))
        }
    };
    let host_name = match &config.host {
        Some(name) => name.clone(),
        None => hypervisor.hostname().await?,
    };
    info!(host = %host_name, backend = hypervisor.name(), "hypervisor connected");

    // ── Components ───────────────────────────────────────────────
    let executor = Arc::new(PinExecutor::new(hypervisor.clone()).await?);
    let conductor = Arc::new(HttpConductorClient::new(
        config.agent.conductor_addr.clone(),
        config.agent_rpc_timeout()?,
        config.auth.rpc_token.clone(),
    ));

    let tracker = HostResourceTracker::new(hypervisor.clone(), conductor.clone(), host_name.clone())
        .with_advertise(config.agent.advertise_addr())
        .with_interval(config.tracker_interval()?)
        .with_run_immediately(config.agent.tracker_run_immediately);

    let dispatcher = Arc::new(
        EventDispatcher::new(
            host_name.clone(),
            config.agent.trigger_metadata_key.clone(),
            conductor,
            executor.clone(),
        )
        .with_mode(config.agent.dispatch_mode),
    );

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tracker_shutdown = shutdown_rx.clone();
    let dispatcher_shutdown = shutdown_rx.clone();

    // ── Background tasks ─────────────────────────────────────────
    let tracker_handle = tokio::spawn(async move {
        tracker.run(tracker_shutdown).await;
    });

    let (notify_tx, notify_rx) = mpsc::channel(config.agent.notification_queue.max(1));
    let dispatcher_handle = tokio::spawn(dispatcher.run(notify_rx, dispatcher_shutdown));

    // ── RPC server ───────────────────────────────────────────────
    let router = pinwheel_agent::build_router(AgentState {
        executor,
        notifications: notify_tx,
        token: config.auth.rpc_token.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.agent.listen).await?;
    info!(addr = %listener.local_addr()?, advertise = %config.agent.advertise_addr(), "agent listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = tracker_handle.await;
    let _ = dispatcher_handle.await;

    info!("agent stopped");
    Ok(())
}
