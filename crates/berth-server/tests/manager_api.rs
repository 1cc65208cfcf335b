use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

use berth_server::{app_router, build_state};
use berth_types::StreamEvent;

const ENGINE_INFO: &str = r#"{"ID":"engine-1","Containers":3,"ServerVersion":"27.0.1"}"#;

const PULL_PROGRESS: &str = concat!(
    r#"{"status":"Pulling from library/nginx","id":"1.27"}"#,
    "\n",
    r#"{"status":"Downloading","id":"f90a","progressDetail":{"current":1024,"total":4096}}"#,
    "\n",
    r#"{"status":"Pull complete","id":"f90a"}"#,
    "\n",
);

/// Minimal scripted engine: answers every request on its unix socket with a
/// fixed JSON body, except `/images/create` which gets pull progress lines.
async fn start_fake_engine(dir: &Path) -> PathBuf {
    let socket = dir.join("engine.sock");
    let listener = UnixListener::bind(&socket).expect("bind engine socket");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let body = if head.starts_with("POST /images/create") {
                    PULL_PROGRESS
                } else {
                    ENGINE_INFO
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    socket
}

async fn start_manager(state_dir: &Path) -> SocketAddr {
    let state = build_state(state_dir).await.expect("build state");
    let app = app_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind manager");
    let addr = listener.local_addr().expect("manager addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("manager serve");
    });
    addr
}

async fn start_agent(engine_socket: PathBuf, secret: &str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind agent");
    let addr = listener.local_addr().expect("agent addr");
    let app = berth_agent::router(berth_agent::AgentConfig {
        engine_socket,
        secret: secret.to_string(),
    });
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("agent serve");
    });
    addr
}

fn write_config(state_dir: &Path, config: serde_json::Value) {
    std::fs::create_dir_all(state_dir).expect("state dir");
    std::fs::write(
        state_dir.join("config.json"),
        serde_json::to_string_pretty(&config).expect("config json"),
    )
    .expect("write config");
}

fn parse_ndjson(raw: &str) -> Vec<StreamEvent> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<StreamEvent>(line).expect("event line"))
        .collect()
}

#[tokio::test]
async fn endpoint_crud_round_trip_never_leaks_the_secret() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = start_manager(dir.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{manager}/endpoints"))
        .json(&serde_json::json!({
            "id": "build-1",
            "name": "build host",
            "kind": "agent",
            "host": "10.0.0.5",
            "port": 9002,
            "secret": "s3cr3t"
        }))
        .send()
        .await
        .expect("create endpoint");
    assert_eq!(response.status(), 201);
    let raw = response.text().await.expect("body");
    assert!(!raw.contains("s3cr3t"), "secret leaked in create response");

    let response = client
        .get(format!("http://{manager}/endpoints"))
        .send()
        .await
        .expect("list endpoints");
    let raw = response.text().await.expect("list body");
    assert!(!raw.contains("s3cr3t"), "secret leaked in listing");
    let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let endpoints = parsed["endpoints"].as_array().expect("array");
    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0]["id"], "local");
    assert_eq!(endpoints[1]["id"], "build-1");
    assert_eq!(endpoints[1]["has_secret"], true);

    let response = client
        .delete(format!("http://{manager}/endpoints/build-1"))
        .send()
        .await
        .expect("delete endpoint");
    assert_eq!(response.status(), 200);

    // Unknown kinds must surface as an explicit error, not a crash.
    let response = client
        .post(format!("http://{manager}/endpoints"))
        .json(&serde_json::json!({
            "id": "weird",
            "name": "weird",
            "kind": "teleport",
            "host": "x"
        }))
        .send()
        .await
        .expect("bad kind");
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn local_passthrough_reaches_the_engine_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_socket = start_fake_engine(dir.path()).await;
    write_config(
        dir.path(),
        serde_json::json!({"local_socket": engine_socket.to_string_lossy()}),
    );
    let manager = start_manager(dir.path()).await;

    let response = reqwest::get(format!("http://{manager}/endpoints/local/engine/v1.41/info"))
        .await
        .expect("passthrough");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), ENGINE_INFO);
}

#[tokio::test]
async fn agent_endpoint_returns_the_same_payload_as_local() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_socket = start_fake_engine(dir.path()).await;
    write_config(
        dir.path(),
        serde_json::json!({"local_socket": engine_socket.to_string_lossy()}),
    );
    let manager = start_manager(dir.path()).await;
    let agent = start_agent(engine_socket, "s3cr3t").await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{manager}/endpoints"))
        .json(&serde_json::json!({
            "id": "remote-1",
            "name": "remote host",
            "kind": "agent",
            "host": "127.0.0.1",
            "port": agent.port(),
            "secret": "s3cr3t"
        }))
        .send()
        .await
        .expect("register agent endpoint");
    assert_eq!(response.status(), 201);

    let local = reqwest::get(format!("http://{manager}/endpoints/local/engine/v1.41/info"))
        .await
        .expect("local call")
        .text()
        .await
        .expect("local body");
    let remote = reqwest::get(format!(
        "http://{manager}/endpoints/remote-1/engine/v1.41/info"
    ))
    .await
    .expect("remote call")
    .text()
    .await
    .expect("remote body");
    assert_eq!(local, remote);
}

#[tokio::test]
async fn unreachable_agent_fails_fast_with_a_tagged_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = start_manager(dir.path()).await;

    // Find a port nothing listens on.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{manager}/endpoints"))
        .json(&serde_json::json!({
            "id": "down-1",
            "name": "down host",
            "kind": "agent",
            "host": "127.0.0.1",
            "port": dead_port,
            "secret": "s3cr3t"
        }))
        .send()
        .await
        .expect("register");
    assert_eq!(response.status(), 201);

    let response = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        reqwest::get(format!("http://{manager}/endpoints/down-1/engine/v1.41/info")),
    )
    .await
    .expect("must fail fast, not hang")
    .expect("response");
    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.expect("error body");
    assert_eq!(body["code"], "ENGINE_UNREACHABLE");
}

fn write_compose_stub(dir: &Path) -> PathBuf {
    let path = dir.join("fake-docker");
    std::fs::write(
        &path,
        r#"#!/bin/sh
if [ -n "$ARGS_LOG" ]; then
  echo "$*" >> "$ARGS_LOG"
fi
echo "ARGS:$*"
echo "step one"
echo "step two"
"#,
    )
    .expect("write stub");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }
    path
}

#[tokio::test]
async fn stack_operations_stream_ordered_events_with_one_terminal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stub = write_compose_stub(dir.path());
    write_config(
        dir.path(),
        serde_json::json!({"compose_bin": stub.to_string_lossy()}),
    );
    let manager = start_manager(dir.path()).await;
    let client = reqwest::Client::new();

    let args_log = dir.path().join("args.log");
    let response = client
        .post(format!("http://{manager}/stacks"))
        .json(&serde_json::json!({
            "name": "web",
            "definition": "services:\n  web:\n    image: nginx:alpine\n",
            "env": [{"name": "ARGS_LOG", "value": args_log.to_string_lossy()}]
        }))
        .send()
        .await
        .expect("create stack");
    assert_eq!(response.status(), 201);

    // down then up; both must address the same explicit project identity.
    for op in ["down", "up"] {
        let response = client
            .post(format!("http://{manager}/stacks/web/{op}"))
            .send()
            .await
            .expect("stack op");
        assert_eq!(response.status(), 200);
        let raw = response.text().await.expect("stream body");
        let events = parse_ndjson(&raw);

        assert!(matches!(events.first(), Some(StreamEvent::Step { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Cmd { message } if message.contains("--project-name web"))));
        let infos: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Info { message } => Some(message),
                _ => None,
            })
            .collect();
        let step_positions: Vec<usize> = infos
            .iter()
            .enumerate()
            .filter(|(_, m)| m.starts_with("step "))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(step_positions.len(), 2);
        assert!(step_positions[0] < step_positions[1], "lines out of order");

        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "exactly one terminal event");
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    let log = std::fs::read_to_string(&args_log).expect("args log");
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert!(
            line.contains("--project-name web"),
            "project identity drifted: {line}"
        );
    }
    assert!(log.contains(" down"));
    assert!(log.contains(" up -d"));
}

#[tokio::test]
async fn unknown_stack_operation_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = start_manager(dir.path()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{manager}/stacks/web/deploy"))
        .send()
        .await
        .expect("bad op");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn image_pull_translates_engine_progress_into_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine_socket = start_fake_engine(dir.path()).await;
    write_config(
        dir.path(),
        serde_json::json!({"local_socket": engine_socket.to_string_lossy()}),
    );
    let manager = start_manager(dir.path()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{manager}/endpoints/local/images/pull"))
        .json(&serde_json::json!({"image": "nginx:1.27"}))
        .send()
        .await
        .expect("pull");
    assert_eq!(response.status(), 200);
    let raw = response.text().await.expect("stream");
    let events = parse_ndjson(&raw);

    assert!(
        matches!(events.first(), Some(StreamEvent::Step { message }) if message.contains("nginx:1.27"))
    );
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::Progress {
            id,
            current: 1024,
            total: 4096
        } if id == "f90a"
    )));
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}
