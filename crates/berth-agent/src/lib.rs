//! Reverse proxy that exposes a local Docker engine socket to a remote
//! manager without exposing the socket itself. Every request is gated by a
//! shared secret; plain requests are forwarded byte-transparently and
//! upgrade requests (exec/attach/terminal) become spliced raw streams,
//! including Docker's 200-hijack convention.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use serde_json::json;

use berth_client::{
    http1, splice, EngineClient, EngineError, EngineRequest, AGENT_SECRET_HEADER,
    AGENT_SECRET_HEADER_LEGACY,
};

mod secret;

pub use secret::{load_or_create_secret, SecretMaterial};

const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub engine_socket: PathBuf,
    pub secret: String,
}

#[derive(Clone)]
struct AgentState {
    client: Arc<EngineClient>,
    secret: Arc<String>,
}

pub fn router(config: AgentConfig) -> Router {
    let state = AgentState {
        client: Arc::new(EngineClient::local(&config.engine_socket)),
        secret: Arc::new(config.secret),
    };
    Router::new()
        .route("/_agent/healthz", get(healthz))
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(state.clone(), secret_gate))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, config: AgentConfig) -> anyhow::Result<()> {
    let app = router(config);
    tracing::info!("agent listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    })
    .await?;
    Ok(())
}

/// Rejects before any engine-socket I/O happens. Both the canonical header
/// and the legacy alias are accepted.
async fn secret_gate(
    State(state): State<AgentState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let provided = extract_secret(request.headers());
    if provided.as_deref() == Some(state.secret.as_str()) {
        // The secret is transport metadata for this hop; the engine never
        // sees it.
        request.headers_mut().remove(AGENT_SECRET_HEADER);
        request.headers_mut().remove(AGENT_SECRET_HEADER_LEGACY);
        return next.run(request).await;
    }
    tracing::warn!("rejected request from {peer}: missing or invalid agent secret");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "missing or invalid agent secret"})),
    )
        .into_response()
}

fn extract_secret(headers: &HeaderMap) -> Option<String> {
    for name in [AGENT_SECRET_HEADER, AGENT_SECRET_HEADER_LEGACY] {
        if let Some(value) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return Some(value.to_string());
        }
    }
    None
}

async fn healthz(State(state): State<AgentState>) -> Response {
    let engine_ok = state
        .client
        .request(EngineRequest::get("/_ping"))
        .await
        .map(|r| (200..300).contains(&r.status))
        .unwrap_or(false);
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "engine_reachable": engine_ok,
    }))
    .into_response()
}

async fn proxy(State(state): State<AgentState>, request: Request) -> Response {
    if wants_upgrade(request.headers()) {
        proxy_upgrade(state, request).await
    } else {
        proxy_plain(state, request).await
    }
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false)
        || headers.contains_key("upgrade")
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn engine_error_response(err: EngineError) -> Response {
    let (status, code) = match &err {
        EngineError::Unreachable(_) => (StatusCode::BAD_GATEWAY, "ENGINE_UNREACHABLE"),
        EngineError::UpgradeRejected { .. } => (StatusCode::BAD_GATEWAY, "UPGRADE_REJECTED"),
        _ => (StatusCode::BAD_GATEWAY, "ENGINE_PROTOCOL_ERROR"),
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": code})),
    )
        .into_response()
}

/// Forwards one request and relays the engine's answer unmodified apart
/// from the recomputed hop-by-hop headers. The payload is never
/// interpreted.
async fn proxy_plain(state: AgentState, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_headers(request.headers());

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("failed to read request body: {err}")})),
            )
                .into_response();
        }
    };

    let engine_request = EngineRequest {
        method,
        path_and_query,
        headers,
        body,
    };

    let engine_response = match state.client.request(engine_request).await {
        Ok(response) => response,
        Err(err) => return engine_error_response(err),
    };

    let mut builder = Response::builder().status(engine_response.status);
    for (name, value) in &engine_response.headers {
        if http1::is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(engine_response.body.into_stream()))
        .unwrap_or_else(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("relay failed: {err}"),
            )
                .into_response()
        })
}

/// Negotiates the raw duplex with the engine first, then answers the client
/// with a protocol switch and splices both sockets. The engine may either
/// upgrade properly (101) or hijack (200 on a declared-upgrade request);
/// the client always observes 101.
async fn proxy_upgrade(state: AgentState, mut request: Request) -> Response {
    let Some(on_upgrade) = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "connection is not upgradable"})),
        )
            .into_response();
    };

    let method = request.method().as_str().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_headers(request.headers());
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("failed to read request body: {err}")})),
            )
                .into_response();
        }
    };

    let engine_request = EngineRequest {
        method,
        path_and_query,
        headers,
        body,
    };

    let upgraded = match state.client.upgrade(engine_request).await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            if let EngineError::UpgradeRejected { status } = &err {
                // Protocol violation: drop the exchange without
                // interpreting the payload.
                tracing::warn!("engine rejected upgrade with status {status}");
            }
            let mut response = engine_error_response(err);
            response
                .headers_mut()
                .insert("connection", HeaderValue::from_static("close"));
            return response;
        }
    };

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(client_io) => {
                let client_io: berth_client::BoxedStream = Box::new(TokioIo::new(client_io));
                let (to_engine, to_client) = splice(client_io, upgraded.stream).await;
                tracing::debug!("tunnel closed: {to_engine}B out, {to_client}B in");
            }
            Err(err) => {
                tracing::warn!("client upgrade failed after engine handshake: {err}");
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("connection", "Upgrade")
        .header("upgrade", berth_client::UPGRADE_PROTOCOL_TCP);
    if upgraded.hijacked {
        // The engine's 200 must never reach the client; synthesize the
        // switch it skipped.
        builder = builder.header("content-type", RAW_STREAM_CONTENT_TYPE);
    } else {
        for (name, value) in &upgraded.head.headers {
            if http1::is_hop_by_hop(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }
    }
    builder.body(Body::empty()).unwrap_or_else(|err| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("upgrade relay failed: {err}"),
        )
            .into_response()
    })
}
