//! Uniform client for one endpoint's Docker engine, regardless of how the
//! bytes get there. The four transports share a single request/upgrade
//! surface; callers never branch on the variant.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

pub mod http1;
mod ssh;

pub use http1::{BodyReader, PrefixedStream, ResponseHead};
pub use ssh::SshTarget;

/// Canonical shared-secret header checked by the agent.
pub const AGENT_SECRET_HEADER: &str = "X-Agent-Secret";
/// Legacy alias still accepted for older deployments.
pub const AGENT_SECRET_HEADER_LEGACY: &str = "X-Dma-Secret";

/// Default engine control socket on the local host.
pub const DEFAULT_ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// Protocol token Docker uses when an exec/attach client asks to take over
/// the connection.
pub const UPGRADE_PROTOCOL_TCP: &str = "tcp";

pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine (or the hop in front of it) could not be reached at all.
    #[error("engine unreachable: {0}")]
    Unreachable(String),
    /// The engine answered an upgrade request with something other than a
    /// protocol switch or a hijack.
    #[error("upgrade rejected with status {status}")]
    UpgradeRejected { status: u16 },
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl EngineRequest {
    pub fn new(method: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path_and_query: path_and_query.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self::new("GET", path_and_query)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BodyReader,
}

impl std::fmt::Debug for EngineResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl EngineResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub async fn bytes(self) -> Result<Vec<u8>, EngineError> {
        Ok(self.body.collect().await?)
    }
}

/// Result of a successful upgrade negotiation: the raw duplex stream plus
/// whether the engine hijacked (answered `200`) instead of switching
/// protocols with `101`.
pub struct UpgradedStream {
    pub head: ResponseHead,
    pub hijacked: bool,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for UpgradedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedStream")
            .field("head", &self.head)
            .field("hijacked", &self.hijacked)
            .finish_non_exhaustive()
    }
}

/// Capability object for one endpoint's engine. Exactly four shapes exist;
/// an unrecognized endpoint kind is a registry-load error, never a variant
/// here.
#[derive(Debug, Clone)]
pub enum EngineClient {
    Local {
        socket_path: PathBuf,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Agent {
        host: String,
        port: u16,
        secret: String,
    },
    Ssh(SshTarget),
}

impl EngineClient {
    pub fn local(socket_path: impl AsRef<Path>) -> Self {
        EngineClient::Local {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        EngineClient::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn agent(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        EngineClient::Agent {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    pub fn ssh(target: SshTarget) -> Self {
        EngineClient::Ssh(target)
    }

    /// Human-readable target for logs. Never includes the secret.
    pub fn target_label(&self) -> String {
        match self {
            EngineClient::Local { socket_path } => format!("unix://{}", socket_path.display()),
            EngineClient::Tcp { host, port } => format!("tcp://{host}:{port}"),
            EngineClient::Agent { host, port, .. } => format!("agent://{host}:{port}"),
            EngineClient::Ssh(target) => format!("ssh://{}@{}:{}", target.username, target.host, target.port),
        }
    }

    fn authority(&self) -> String {
        match self {
            EngineClient::Local { .. } | EngineClient::Ssh(_) => "localhost".to_string(),
            EngineClient::Tcp { host, port } | EngineClient::Agent { host, port, .. } => {
                format!("{host}:{port}")
            }
        }
    }

    async fn open(&self) -> Result<BoxedStream, EngineError> {
        match self {
            EngineClient::Local { socket_path } => {
                let stream = UnixStream::connect(socket_path)
                    .await
                    .map_err(|err| EngineError::Unreachable(format!("{}: {err}", socket_path.display())))?;
                Ok(Box::new(stream))
            }
            EngineClient::Tcp { host, port } | EngineClient::Agent { host, port, .. } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|err| EngineError::Unreachable(format!("{host}:{port}: {err}")))?;
                Ok(Box::new(stream))
            }
            EngineClient::Ssh(target) => ssh::open_stream(target).await,
        }
    }

    /// Headers this transport adds on top of the caller's.
    fn transport_headers(&self) -> Vec<(String, String)> {
        match self {
            EngineClient::Agent { secret, .. } => {
                vec![(AGENT_SECRET_HEADER.to_string(), secret.clone())]
            }
            _ => Vec::new(),
        }
    }

    /// Sends one request and returns the response with a streamable body.
    pub async fn request(&self, req: EngineRequest) -> Result<EngineResponse, EngineError> {
        let mut stream = self.open().await?;
        let mut headers = req.headers;
        headers.extend(self.transport_headers());
        http1::write_request(
            &mut stream,
            &req.method,
            &req.path_and_query,
            &self.authority(),
            &headers,
            &req.body,
            http1::ConnectionMode::Close,
        )
        .await?;
        let (head, leftover) = http1::read_response_head(&mut stream).await?;
        let body = if req.method.eq_ignore_ascii_case("HEAD") {
            BodyReader::empty(stream)
        } else {
            BodyReader::new(&head, leftover, stream)
        };
        Ok(EngineResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }

    /// Convenience for small JSON control responses.
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value, EngineError> {
        let response = self.request(EngineRequest::get(path)).await?;
        let status = response.status;
        let bytes = response.bytes().await?;
        if !(200..300).contains(&status) {
            return Err(EngineError::Protocol(format!(
                "GET {path} returned {status}: {}",
                String::from_utf8_lossy(&bytes).chars().take(200).collect::<String>()
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| EngineError::Protocol(format!("GET {path}: invalid JSON: {err}")))
    }

    /// Negotiates a raw duplex stream (exec/attach style). Detects both the
    /// standard `101` switch and Docker's `200` hijack; anything else is a
    /// protocol violation and the connection is dropped.
    pub async fn upgrade(&self, req: EngineRequest) -> Result<UpgradedStream, EngineError> {
        let mut stream = self.open().await?;
        let mut headers = req.headers;
        headers.extend(self.transport_headers());
        http1::write_request(
            &mut stream,
            &req.method,
            &req.path_and_query,
            &self.authority(),
            &headers,
            &req.body,
            http1::ConnectionMode::Upgrade(UPGRADE_PROTOCOL_TCP),
        )
        .await?;
        let (head, leftover) = http1::read_response_head(&mut stream).await?;
        match head.status {
            101 => Ok(UpgradedStream {
                hijacked: false,
                stream: Box::new(PrefixedStream::new(leftover, stream)),
                head,
            }),
            200 => Ok(UpgradedStream {
                hijacked: true,
                stream: Box::new(PrefixedStream::new(leftover, stream)),
                head,
            }),
            status => Err(EngineError::UpgradeRejected { status }),
        }
    }
}

/// Copies bytes in both directions until either side closes. Errors after
/// one side has shut down are normal teardown and are swallowed.
pub async fn splice(mut a: BoxedStream, mut b: BoxedStream) -> (u64, u64) {
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok(counts) => counts,
        Err(err) => {
            tracing::debug!("spliced stream closed: {err}");
            (0, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    async fn fake_engine(responses: &'static [u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                // Read the request head before answering.
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(responses).await;
            }
        });
        (dir, socket)
    }

    #[tokio::test]
    async fn local_request_round_trips() {
        let (_dir, socket) =
            fake_engine(b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\n\r\n{\"ok\":true,\"n\":1}").await;
        let client = EngineClient::local(&socket);
        let value = client.get_json("/_ping").await.expect("json");
        assert_eq!(value["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn unreachable_socket_fails_fast_with_tagged_error() {
        let client = EngineClient::local("/nonexistent/berth-test.sock");
        let err = client
            .request(EngineRequest::get("/_ping"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Unreachable(_)));
    }

    #[tokio::test]
    async fn upgrade_detects_hijack_and_exposes_raw_stream() {
        let (_dir, socket) =
            fake_engine(b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\nraw-bytes").await;
        let client = EngineClient::local(&socket);
        let upgraded = client
            .upgrade(EngineRequest::new("POST", "/exec/abc/start"))
            .await
            .expect("upgrade");
        assert!(upgraded.hijacked);
        let mut stream = upgraded.stream;
        let mut out = [0u8; 9];
        stream.read_exact(&mut out).await.expect("raw bytes");
        assert_eq!(&out, b"raw-bytes");
    }

    #[tokio::test]
    async fn upgrade_rejects_unexpected_status() {
        let (_dir, socket) =
            fake_engine(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let client = EngineClient::local(&socket);
        let err = client
            .upgrade(EngineRequest::new("POST", "/exec/abc/start"))
            .await
            .expect_err("must reject");
        assert!(matches!(err, EngineError::UpgradeRejected { status: 404 }));
    }
}
