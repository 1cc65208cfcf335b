use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth_core::{
    load_manager_config, run_status_poller, EndpointRegistry, ManagerConfig, StackStore,
    StatusBoard,
};
use berth_runtime::ComposeRunner;

mod http;

pub use http::app_router;

#[derive(Clone)]
pub struct AppState {
    pub config: ManagerConfig,
    pub registry: EndpointRegistry,
    pub stacks: Arc<StackStore>,
    pub status: StatusBoard,
    pub runner: ComposeRunner,
}

/// Wires registries and stores from one state directory.
pub async fn build_state(state_dir: &Path) -> anyhow::Result<AppState> {
    let config = load_manager_config(state_dir).await?;
    let registry = EndpointRegistry::open(
        state_dir.join("endpoints.json"),
        PathBuf::from(&config.local_socket),
        config.local_display_host.clone(),
    )
    .await;
    let stacks = Arc::new(StackStore::open(state_dir.join("stacks")).await?);
    Ok(AppState {
        runner: ComposeRunner::new(config.compose_bin.clone()),
        registry,
        stacks,
        status: StatusBoard::new(),
        config,
    })
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let poller = tokio::spawn(run_status_poller(
        state.registry.clone(),
        state.status.clone(),
        Duration::from_secs(state.config.status_poll_secs.max(1)),
    ));

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("manager listening on {}", listener.local_addr()?);

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    })
    .await;

    poller.abort();
    result?;
    Ok(())
}
