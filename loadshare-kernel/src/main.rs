/**
 * LOADSHARE KERNEL - Point d'entrée du coordinateur de partage de charge
 *
 * RÔLE : assemble config, groupe persistant, découverte mDNS, statuts des
 * pairs, tâche coordinateur et API REST.
 *
 * ARCHITECTURE : une tâche coordinateur propriétaire de tout l'état moteur,
 * un poller de statuts HTTP, un serveur Axum qui ne lit que l'état publié.
 * Ctrl-C → arrêt propre (requête en vol libérée, groupe sauvegardé).
 */

use anyhow::Context;
use loadshare_kernel::config::load_config;
use loadshare_kernel::coordinator::Coordinator;
use loadshare_kernel::group::GroupStore;
use loadshare_kernel::http::{build_router, AppState};
use loadshare_kernel::mdns::MdnsBrowser;
use loadshare_kernel::status::{StatusBoard, StatusPoller};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loadshare_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(
        enabled = cfg.group.enabled,
        group = %cfg.group.group_id,
        max_current = cfg.group.max_current,
        safety_factor = cfg.group.safety_factor,
        "configuration loaded"
    );

    // groupe persistant : un fichier illisible laisse un groupe vide, jamais un crash
    let group = Arc::new(GroupStore::on_disk(&cfg.storage.peers_file));
    match group.load() {
        Ok(count) => info!(peers = count, path = %cfg.storage.peers_file, "group peers loaded"),
        Err(e) => warn!(error = %e, path = %cfg.storage.peers_file, "failed to load group peers, starting empty"),
    }

    let board = StatusBoard::new();
    let primitive = MdnsBrowser::new(cfg.discovery.collect_window());
    let coordinator = Coordinator::new(&cfg, Box::new(primitive), group, Arc::new(board.clone()));
    let handle = coordinator.handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let poller = StatusPoller::new(
        board,
        Duration::from_millis(cfg.status.poll_interval_ms),
        Duration::from_millis(cfg.status.request_timeout_ms),
    );
    let poller_task = tokio::spawn(poller.run(handle.state(), shutdown_rx.clone()));

    let app = build_router(AppState::new(handle));
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");

    let mut http_shutdown = shutdown_rx;
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown.changed().await;
    });

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        let _ = signal_tx.send(true);
    });

    if let Err(e) = server.await {
        error!(error = %e, "http server failed");
        let _ = shutdown_tx.send(true);
    }

    coordinator_task.await.context("coordinator task panicked")?;
    poller_task.await.context("status poller task panicked")?;
    info!("loadshare kernel stopped");
    Ok(())
}
