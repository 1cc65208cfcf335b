use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use berth_client::{EngineClient, EngineRequest};
use berth_types::EndpointStatus;

use crate::{now_ms, EndpointRegistry};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest reachability probe per endpoint, read by the API without ever
/// touching the probe path.
#[derive(Clone, Default)]
pub struct StatusBoard {
    statuses: Arc<RwLock<HashMap<String, EndpointStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, EndpointStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<EndpointStatus> {
        self.statuses.read().await.get(id).cloned()
    }

    async fn record(&self, id: String, status: EndpointStatus) {
        self.statuses.write().await.insert(id, status);
    }
}

/// Probes every endpoint on a fixed interval, decoupled from the request
/// path so UI-facing status never blocks control operations.
pub async fn run_status_poller(
    registry: EndpointRegistry,
    board: StatusBoard,
    interval: Duration,
) {
    loop {
        let endpoints = registry.list().await;
        for summary in endpoints {
            let status = match registry.resolve(&summary.id).await {
                Ok(client) => probe(&client).await,
                Err(_) => EndpointStatus {
                    online: false,
                    checked_at_ms: now_ms(),
                    engine_version: None,
                    error: Some("no usable client for endpoint".to_string()),
                },
            };
            if !status.online {
                tracing::debug!(
                    "endpoint {} offline: {}",
                    summary.id,
                    status.error.as_deref().unwrap_or("unknown")
                );
            }
            board.record(summary.id, status).await;
        }
        tokio::time::sleep(interval).await;
    }
}

async fn probe(client: &EngineClient) -> EndpointStatus {
    let checked_at_ms = now_ms();
    let ping = tokio::time::timeout(PROBE_TIMEOUT, client.request(EngineRequest::get("/_ping")));
    match ping.await {
        Ok(Ok(response)) if (200..300).contains(&response.status) => {
            // Drain the tiny ping body, then enrich with the engine version.
            let _ = response.bytes().await;
            let engine_version = tokio::time::timeout(PROBE_TIMEOUT, client.get_json("/version"))
                .await
                .ok()
                .and_then(|r| r.ok())
                .and_then(|v| v.get("Version").and_then(|v| v.as_str()).map(String::from));
            EndpointStatus {
                online: true,
                checked_at_ms,
                engine_version,
                error: None,
            }
        }
        Ok(Ok(response)) => EndpointStatus {
            online: false,
            checked_at_ms,
            engine_version: None,
            error: Some(format!("ping returned status {}", response.status)),
        },
        Ok(Err(err)) => EndpointStatus {
            online: false,
            checked_at_ms,
            engine_version: None,
            error: Some(err.to_string()),
        },
        Err(_) => EndpointStatus {
            online: false,
            checked_at_ms,
            engine_version: None,
            error: Some("probe timed out".to_string()),
        },
    }
}
