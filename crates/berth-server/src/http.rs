use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use berth_client::{http1, splice, EngineClient, EngineError, EngineRequest};
use berth_core::RegistryError;
use berth_runtime::DeployTarget;
use berth_types::{Endpoint, EnvVar, LineDecoder, StackCommand, StreamEvent, LOCAL_ENDPOINT_ID};

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, code: Option<&str>) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: code.map(str::to_string),
        }),
    )
        .into_response()
}

fn registry_error_response(err: RegistryError) -> Response {
    match &err {
        RegistryError::NotFound { id } => error_response(
            StatusCode::NOT_FOUND,
            format!("endpoint '{id}' not found"),
            Some("ENDPOINT_NOT_FOUND"),
        ),
        RegistryError::LocalEndpointProtected => error_response(
            StatusCode::FORBIDDEN,
            "the local endpoint's transport binding cannot be changed",
            Some("LOCAL_ENDPOINT_PROTECTED"),
        ),
        RegistryError::InvalidEndpoint { detail } => {
            error_response(StatusCode::BAD_REQUEST, detail, Some("INVALID_ENDPOINT"))
        }
        RegistryError::Unbound { id, detail } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("endpoint '{id}' is unreachable: {detail}"),
            Some("ENDPOINT_UNBOUND"),
        ),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    let (status, code) = match &err {
        // Distinguish "host down" from "operation failed" for UIs.
        EngineError::Unreachable(_) => (StatusCode::BAD_GATEWAY, "ENGINE_UNREACHABLE"),
        EngineError::UpgradeRejected { .. } => (StatusCode::BAD_GATEWAY, "UPGRADE_REJECTED"),
        _ => (StatusCode::BAD_GATEWAY, "ENGINE_PROTOCOL_ERROR"),
    };
    error_response(status, err.to_string(), Some(code))
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/endpoints", get(list_endpoints).post(create_endpoint))
        .route("/endpoints/status", get(endpoint_statuses))
        .route(
            "/endpoints/{id}",
            put(update_endpoint).delete(delete_endpoint),
        )
        .route("/endpoints/{id}/engine/{*path}", any(engine_passthrough))
        .route("/endpoints/{id}/images/pull", post(pull_image))
        .route("/stacks", get(list_stacks).post(create_stack))
        .route("/stacks/{name}", get(get_stack).delete(delete_stack))
        .route(
            "/stacks/{name}/definition",
            get(read_definition).put(save_definition),
        )
        .route("/stacks/{name}/env", put(set_stack_env))
        .route("/stacks/{name}/{op}", post(stack_operation))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn list_endpoints(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"endpoints": state.registry.list().await}))
}

async fn endpoint_statuses(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"statuses": state.status.snapshot().await}))
}

async fn create_endpoint(
    State(state): State<AppState>,
    Json(endpoint): Json<Endpoint>,
) -> Response {
    match state.registry.upsert(endpoint).await {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => registry_error_response(err),
    }
}

async fn update_endpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut endpoint): Json<Endpoint>,
) -> Response {
    endpoint.id = id;
    match state.registry.upsert(endpoint).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => registry_error_response(err),
    }
}

async fn delete_endpoint(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.remove(&id).await {
        Ok(persist_warning) => Json(json!({
            "deleted": true,
            "warning": persist_warning,
        }))
        .into_response(),
        Err(err) => registry_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Engine passthrough (plain + tunnel sessions)
// ---------------------------------------------------------------------------

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

async fn engine_passthrough(
    State(state): State<AppState>,
    Path((id, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    let client = match state.registry.resolve(&id).await {
        Ok(client) => client,
        Err(err) => return registry_error_response(err),
    };
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let path_and_query = format!("/{rest}{query}");

    if wants_upgrade(request.headers()) {
        relay_upgrade(client, path_and_query, request).await
    } else {
        relay_plain(client, path_and_query, request).await
    }
}

async fn relay_plain(client: Arc<EngineClient>, path_and_query: String, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let headers = collect_headers(request.headers());
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
                None,
            );
        }
    };

    let engine_response = match client
        .request(EngineRequest {
            method,
            path_and_query,
            headers,
            body,
        })
        .await
    {
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
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("relay failed: {err}"),
                None,
            )
        })
}

/// Manager-side tunnel session: upgrade toward the engine through whichever
/// transport the endpoint uses, then splice the caller's socket onto it.
async fn relay_upgrade(
    client: Arc<EngineClient>,
    path_and_query: String,
    mut request: Request,
) -> Response {
    let Some(on_upgrade) = request.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "connection is not upgradable",
            None,
        );
    };

    let method = request.method().as_str().to_string();
    let headers = collect_headers(request.headers());
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
                None,
            );
        }
    };

    let upgraded = match client
        .upgrade(EngineRequest {
            method,
            path_and_query,
            headers,
            body,
        })
        .await
    {
        Ok(upgraded) => upgraded,
        Err(err) => {
            let mut response = engine_error_response(err);
            response
                .headers_mut()
                .insert("connection", HeaderValue::from_static("close"));
            return response;
        }
    };

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(caller_io) => {
                let caller_io: berth_client::BoxedStream = Box::new(TokioIo::new(caller_io));
                splice(caller_io, upgraded.stream).await;
            }
            Err(err) => {
                tracing::warn!("caller upgrade failed after engine handshake: {err}");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header("connection", "Upgrade")
        .header("upgrade", berth_client::UPGRADE_PROTOCOL_TCP)
        .body(Body::empty())
        .unwrap_or_else(|err| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upgrade relay failed: {err}"),
                None,
            )
        })
}

// ---------------------------------------------------------------------------
// Image pull with progress translation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PullRequest {
    image: String,
    #[serde(default)]
    tag: Option<String>,
}

async fn pull_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<PullRequest>,
) -> Response {
    let client = match state.registry.resolve(&id).await {
        Ok(client) => client,
        Err(err) => return registry_error_response(err),
    };
    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    tokio::spawn(run_pull(client, input, tx));
    ndjson_response(rx)
}

async fn run_pull(client: Arc<EngineClient>, input: PullRequest, events: mpsc::Sender<StreamEvent>) {
    let (image, tag) = match input.tag {
        Some(tag) => (input.image, tag),
        None => split_image_ref(&input.image),
    };
    let _ = events
        .send(StreamEvent::Step {
            message: format!("pulling {image}:{tag}"),
        })
        .await;

    let request = EngineRequest::new("POST", format!("/images/create?fromImage={image}&tag={tag}"));
    let mut response = match client.request(request).await {
        Ok(response) => response,
        Err(err) => {
            let _ = events
                .send(StreamEvent::error(format!("pull failed: {err}")))
                .await;
            return;
        }
    };

    if !(200..300).contains(&response.status) {
        let status = response.status;
        let body = response.bytes().await.unwrap_or_default();
        let detail: String = String::from_utf8_lossy(&body).chars().take(300).collect();
        let _ = events
            .send(StreamEvent::error(format!(
                "pull returned status {status}: {detail}"
            )))
            .await;
        return;
    }

    let mut decoder = LineDecoder::new();
    loop {
        match response.body.next_chunk().await {
            Ok(Some(chunk)) => {
                for line in decoder.push(&chunk) {
                    let event = translate_pull_line(&line);
                    let terminal = event.is_terminal();
                    if events.send(event).await.is_err() || terminal {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = events
                    .send(StreamEvent::error(format!("pull stream failed: {err}")))
                    .await;
                return;
            }
        }
    }
    if let Some(tail) = decoder.finish() {
        let event = translate_pull_line(&tail);
        let terminal = event.is_terminal();
        if events.send(event).await.is_err() || terminal {
            return;
        }
    }
    let _ = events
        .send(StreamEvent::done(format!("pulled {image}:{tag}")))
        .await;
}

/// Maps one line of Docker's pull progress JSON onto the stream protocol.
fn translate_pull_line(line: &str) -> StreamEvent {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return StreamEvent::info(line);
    };
    if let Some(error) = value.get("error").and_then(|v| v.as_str()) {
        return StreamEvent::error(error);
    }
    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let id = value.get("id").and_then(|v| v.as_str());
    if let Some(detail) = value.get("progressDetail") {
        let current = detail.get("current").and_then(|v| v.as_u64());
        let total = detail.get("total").and_then(|v| v.as_u64());
        if let (Some(current), Some(total), Some(id)) = (current, total, id) {
            return StreamEvent::Progress {
                id: id.to_string(),
                current,
                total,
            };
        }
    }
    match id {
        Some(id) => StreamEvent::info(format!("{status} {id}")),
        None => StreamEvent::info(status),
    }
}

fn split_image_ref(raw: &str) -> (String, String) {
    // The tag separator is a ':' after the last '/', so registry ports
    // (registry:5000/app) are left alone.
    let split_at = raw
        .rfind(':')
        .filter(|pos| *pos > raw.rfind('/').unwrap_or(0));
    match split_at {
        Some(pos) => (raw[..pos].to_string(), raw[pos + 1..].to_string()),
        None => (raw.to_string(), "latest".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateStackRequest {
    name: String,
    definition: String,
    #[serde(default)]
    env: Vec<EnvVar>,
}

async fn list_stacks(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"stacks": state.stacks.list().await}))
}

async fn get_stack(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.stacks.get(&name).await {
        Some(stack) => Json(stack).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("stack '{name}' not found"),
            None,
        ),
    }
}

async fn create_stack(
    State(state): State<AppState>,
    Json(input): Json<CreateStackRequest>,
) -> Response {
    match state
        .stacks
        .create(&input.name, &input.definition, input.env)
        .await
    {
        Ok(stack) => (StatusCode::CREATED, Json(stack)).into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteStackQuery {
    #[serde(default)]
    delete_dir: bool,
}

async fn delete_stack(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeleteStackQuery>,
) -> Response {
    match state.stacks.remove(&name, query.delete_dir).await {
        Ok(true) => Json(json!({"deleted": true})).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("stack '{name}' not found"),
            None,
        ),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
    }
}

async fn read_definition(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.stacks.read_definition(&name).await {
        Ok(definition) => Json(json!({"name": name, "definition": definition})).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionUpdate {
    definition: String,
}

async fn save_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<DefinitionUpdate>,
) -> Response {
    match state.stacks.save_definition(&name, &input.definition).await {
        Ok(()) => Json(json!({"saved": true})).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct EnvUpdate {
    env: Vec<EnvVar>,
}

async fn set_stack_env(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<EnvUpdate>,
) -> Response {
    match state.stacks.set_env(&name, input.env).await {
        Ok(stack) => Json(stack).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string(), None),
    }
}

#[derive(Debug, Deserialize)]
struct OperationQuery {
    endpoint: Option<String>,
}

/// Runs one compose operation and streams its events. The response stream
/// ends right after the terminal event; dropping the response aborts the
/// child process.
async fn stack_operation(
    State(state): State<AppState>,
    Path((name, op)): Path<(String, String)>,
    Query(query): Query<OperationQuery>,
) -> Response {
    let Some(command) = StackCommand::parse(&op) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("unknown stack operation '{op}'"),
            None,
        );
    };
    let Some(stack) = state.stacks.get(&name).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("stack '{name}' not found"),
            None,
        );
    };
    let endpoint_id = query
        .endpoint
        .unwrap_or_else(|| LOCAL_ENDPOINT_ID.to_string());
    let Some(descriptor) = state.registry.descriptor(&endpoint_id).await else {
        return registry_error_response(RegistryError::NotFound { id: endpoint_id });
    };
    let target = match DeployTarget::from_endpoint(&descriptor) {
        Ok(target) => target,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string(), None),
    };

    let runner = state.runner.clone();
    let (tx, rx) = mpsc::channel::<StreamEvent>(256);
    tokio::spawn(async move {
        let outcome = runner.run(&stack, command, &target, tx).await;
        tracing::info!(
            "stack '{}' {}: success={} exit_code={:?}",
            stack.name,
            command.as_str(),
            outcome.success,
            outcome.exit_code
        );
    });
    ndjson_response(rx)
}

fn ndjson_response(rx: mpsc::Receiver<StreamEvent>) -> Response {
    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
