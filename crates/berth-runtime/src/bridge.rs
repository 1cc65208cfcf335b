//! Ephemeral loopback listener that lets a tool expecting a local-looking
//! Docker endpoint reach a secret-protected remote agent. One bridge lives
//! for exactly one executor invocation; a leaked listener is a port and fd
//! leak, so teardown is owned by the executor and backstopped by `Drop`.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use berth_client::AGENT_SECRET_HEADER;

#[derive(Clone)]
struct BridgeState {
    client: reqwest::Client,
    upstream: String,
}

pub struct ProxyBridge {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProxyBridge {
    /// Binds an OS-assigned loopback port and starts forwarding to the
    /// agent, injecting the shared secret into every request.
    pub async fn start(agent_host: &str, agent_port: u16, secret: &str) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;

        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            AGENT_SECRET_HEADER,
            HeaderValue::from_str(secret)
                .map_err(|_| anyhow::anyhow!("agent secret is not a valid header value"))?,
        );
        // No global timeout: image pulls through the bridge can legitimately
        // run for minutes.
        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()?;

        let state = BridgeState {
            client,
            upstream: format!("http://{agent_host}:{agent_port}"),
        };
        let app = Router::new().fallback(forward).with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                tracing::warn!("proxy bridge exited with error: {err}");
            }
        });

        tracing::debug!("proxy bridge listening on {addr}");
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value for the spawned tool's DOCKER_HOST override.
    pub fn docker_host(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Deterministic teardown; called on every executor outcome path.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(std::time::Duration::from_secs(5), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for ProxyBridge {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

async fn forward(State(state): State<BridgeState>, request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{}{}", state.upstream, path_and_query);
    let method = request.method().clone();

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        // Host is recomputed from the upstream URL; the secret comes from
        // the client's default headers.
        if name == axum::http::header::HOST {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            )
                .into_response();
        }
    };

    let upstream_response = match state
        .client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return (
                StatusCode::BAD_GATEWAY,
                format!("agent unreachable through bridge: {err}"),
            )
                .into_response();
        }
    };

    let mut builder = Response::builder().status(upstream_response.status().as_u16());
    for (name, value) in upstream_response.headers() {
        if name == reqwest::header::TRANSFER_ENCODING || name == reqwest::header::CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .unwrap_or_else(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("bridge relay failed: {err}"),
            )
                .into_response()
        })
}
