//! Runs `docker compose` operations for a stack against any endpoint,
//! streaming output lines as they arrive. The project name is always the
//! stack name, passed explicitly; letting the tool infer one from the
//! directory is how orphaned duplicate resource sets happen.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use berth_types::{Endpoint, EndpointKind, StackCommand, StackSpec, StreamEvent, COMPOSE_FILE_NAME};

use crate::ProxyBridge;

/// How a compose child reaches the target engine. Only agent targets need
/// the local proxy bridge; tcp and ssh are dialects compose speaks
/// natively through DOCKER_HOST, and local just inherits the environment.
#[derive(Debug, Clone)]
pub enum DeployTarget {
    Local,
    Tcp {
        host: String,
        port: u16,
    },
    Agent {
        host: String,
        port: u16,
        secret: String,
    },
    Ssh {
        username: String,
        host: String,
        port: u16,
    },
}

impl DeployTarget {
    pub fn from_endpoint(endpoint: &Endpoint) -> anyhow::Result<Self> {
        let host = || {
            endpoint
                .host
                .clone()
                .with_context(|| format!("endpoint {} has no host", endpoint.id))
        };
        match endpoint.kind {
            EndpointKind::Local => Ok(DeployTarget::Local),
            EndpointKind::Tcp => Ok(DeployTarget::Tcp {
                host: host()?,
                port: endpoint.port.unwrap_or(2375),
            }),
            EndpointKind::Agent => Ok(DeployTarget::Agent {
                host: host()?,
                port: endpoint.port.unwrap_or(9002),
                secret: endpoint
                    .secret
                    .clone()
                    .with_context(|| format!("endpoint {} has no secret", endpoint.id))?,
            }),
            EndpointKind::Ssh => Ok(DeployTarget::Ssh {
                username: endpoint
                    .username
                    .clone()
                    .with_context(|| format!("endpoint {} has no username", endpoint.id))?,
                host: host()?,
                port: endpoint.port.unwrap_or(22),
            }),
        }
    }

    fn docker_host_override(&self, bridge: Option<&ProxyBridge>) -> Option<String> {
        match self {
            DeployTarget::Local => None,
            DeployTarget::Tcp { host, port } => Some(format!("tcp://{host}:{port}")),
            DeployTarget::Agent { .. } => bridge.map(ProxyBridge::docker_host),
            DeployTarget::Ssh {
                username,
                host,
                port,
            } => Some(format!("ssh://{username}@{host}:{port}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComposeOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Accumulated stderr; the error detail on failure.
    pub stderr: String,
}

impl ComposeOutcome {
    fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stderr: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComposeRunner {
    compose_bin: String,
}

impl ComposeRunner {
    pub fn new(compose_bin: impl Into<String>) -> Self {
        Self {
            compose_bin: compose_bin.into(),
        }
    }

    /// Runs one stack operation, emitting every event the caller will see,
    /// terminal event included. The bridge (when one is needed) is torn
    /// down on every path before this returns.
    pub async fn run(
        &self,
        stack: &StackSpec,
        command: StackCommand,
        target: &DeployTarget,
        events: mpsc::Sender<StreamEvent>,
    ) -> ComposeOutcome {
        send(
            &events,
            StreamEvent::Step {
                message: format!("{} stack '{}'", command.as_str(), stack.name),
            },
        )
        .await;

        let bridge = match target {
            DeployTarget::Agent { host, port, secret } => {
                match ProxyBridge::start(host, *port, secret).await {
                    Ok(bridge) => {
                        send(
                            &events,
                            StreamEvent::Step {
                                message: format!("proxy bridge on {}", bridge.addr()),
                            },
                        )
                        .await;
                        Some(bridge)
                    }
                    Err(err) => {
                        let detail = format!("failed to start proxy bridge: {err}");
                        send(&events, StreamEvent::error(&detail)).await;
                        return ComposeOutcome::failed(detail);
                    }
                }
            }
            _ => None,
        };

        let result = self
            .run_child(stack, command, target, bridge.as_ref(), &events)
            .await;

        if let Some(bridge) = bridge {
            bridge.shutdown().await;
        }

        match result {
            Ok(outcome) => {
                if outcome.success {
                    send(
                        &events,
                        StreamEvent::done(format!("{} completed", command.as_str())),
                    )
                    .await;
                } else {
                    let detail = if outcome.stderr.trim().is_empty() {
                        format!(
                            "compose {} exited with code {}",
                            command.as_str(),
                            outcome
                                .exit_code
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "unknown".to_string())
                        )
                    } else {
                        outcome.stderr.clone()
                    };
                    send(&events, StreamEvent::error(detail)).await;
                }
                outcome
            }
            Err(err) => {
                let detail = format!("compose {} failed: {err:#}", command.as_str());
                send(&events, StreamEvent::error(&detail)).await;
                ComposeOutcome::failed(detail)
            }
        }
    }

    async fn run_child(
        &self,
        stack: &StackSpec,
        command: StackCommand,
        target: &DeployTarget,
        bridge: Option<&ProxyBridge>,
        events: &mpsc::Sender<StreamEvent>,
    ) -> anyhow::Result<ComposeOutcome> {
        let compose_file = Path::new(&stack.dir).join(COMPOSE_FILE_NAME);
        let compose_file = compose_file.to_string_lossy().to_string();

        let mut argv: Vec<&str> = vec![
            "compose",
            "--project-name",
            &stack.name,
            "--file",
            &compose_file,
        ];
        argv.extend_from_slice(command.compose_args());

        send(
            events,
            StreamEvent::Cmd {
                message: format!("{} {}", self.compose_bin, argv.join(" ")),
            },
        )
        .await;

        let mut cmd = Command::new(&self.compose_bin);
        cmd.args(&argv)
            .current_dir(&stack.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Inherited environment first, stack variables on top.
        for var in &stack.env {
            cmd.env(&var.name, &var.value);
        }
        if let Some(docker_host) = target.docker_host_override(bridge) {
            cmd.env("DOCKER_HOST", docker_host);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.compose_bin))?;

        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        let stderr_acc = Arc::new(Mutex::new(String::new()));

        let stdout_task = tokio::spawn(drain_lines(stdout, events.clone(), None));
        let stderr_task = tokio::spawn(drain_lines(
            stderr,
            events.clone(),
            Some(stderr_acc.clone()),
        ));

        let status = tokio::select! {
            status = child.wait() => status.context("wait for compose child")?,
            _ = events.closed() => {
                // Caller went away; a dangling compose child is a leak.
                tracing::warn!("caller disconnected, killing compose child for stack '{}'", stack.name);
                let _ = child.kill().await;
                // Pipes may be held open by grandchildren; don't wait on them.
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ComposeOutcome::failed("caller disconnected"));
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let stderr_text = stderr_acc.lock().await.clone();
        Ok(ComposeOutcome {
            success: status.success(),
            exit_code: status.code(),
            stderr: stderr_text,
        })
    }
}

async fn send(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    let _ = events.send(event).await;
}

/// Producer side of the log channel: one task per pipe, line-buffered, in
/// emission order.
async fn drain_lines(
    reader: impl AsyncRead + Unpin,
    events: mpsc::Sender<StreamEvent>,
    accumulate: Option<Arc<Mutex<String>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(acc) = &accumulate {
            let mut acc = acc.lock().await;
            acc.push_str(&line);
            acc.push('\n');
        }
        if events.send(StreamEvent::info(line)).await.is_err() && accumulate.is_none() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod stub");
        }
        path
    }

    fn stack_in(dir: &Path) -> StackSpec {
        let stack_dir = dir.join("web");
        std::fs::create_dir_all(&stack_dir).expect("stack dir");
        std::fs::write(
            stack_dir.join(COMPOSE_FILE_NAME),
            "services:\n  web:\n    image: nginx:alpine\n",
        )
        .expect("compose file");
        let now = Utc::now();
        StackSpec {
            name: "web".to_string(),
            dir: stack_dir.to_string_lossy().to_string(),
            env: vec![berth_types::EnvVar {
                name: "TAG".to_string(),
                value: "1.27".to_string(),
            }],
            created_at: now,
            updated_at: now,
        }
    }

    async fn run_collect(
        runner: &ComposeRunner,
        stack: &StackSpec,
        command: StackCommand,
        target: &DeployTarget,
    ) -> (ComposeOutcome, Vec<StreamEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = runner.run(stack, command, target, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    fn info_lines(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Info { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn project_identity_is_the_stack_name_for_every_operation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(dir.path(), r#"echo "ARGS:$*""#);
        let runner = ComposeRunner::new(stub.to_string_lossy());
        let stack = stack_in(dir.path());

        for command in [
            StackCommand::Up,
            StackCommand::Down,
            StackCommand::Start,
            StackCommand::Stop,
            StackCommand::Restart,
        ] {
            let (outcome, events) =
                run_collect(&runner, &stack, command, &DeployTarget::Local).await;
            assert!(outcome.success, "{} failed: {}", command.as_str(), outcome.stderr);

            let args_line = info_lines(&events)
                .into_iter()
                .find(|l| l.starts_with("ARGS:"))
                .expect("argv echo");
            assert!(
                args_line.contains("--project-name web"),
                "missing explicit project identity in: {args_line}"
            );
            assert!(args_line.contains("--file"));
            assert!(args_line.contains(command.compose_args()[0]));
            assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        }
    }

    #[tokio::test]
    async fn environment_layers_inherited_then_stack_then_docker_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(
            dir.path(),
            r#"echo "DOCKER_HOST:${DOCKER_HOST:-unset}"
echo "TAG:${TAG:-unset}""#,
        );
        let runner = ComposeRunner::new(stub.to_string_lossy());
        let stack = stack_in(dir.path());

        let target = DeployTarget::Tcp {
            host: "10.1.1.1".to_string(),
            port: 2375,
        };
        let (outcome, events) = run_collect(&runner, &stack, StackCommand::Up, &target).await;
        assert!(outcome.success);
        let lines = info_lines(&events);
        assert!(lines.contains(&"DOCKER_HOST:tcp://10.1.1.1:2375".to_string()));
        assert!(lines.contains(&"TAG:1.27".to_string()));

        let target = DeployTarget::Ssh {
            username: "ops".to_string(),
            host: "build-7".to_string(),
            port: 22,
        };
        let (_, events) = run_collect(&runner, &stack, StackCommand::Up, &target).await;
        assert!(info_lines(&events).contains(&"DOCKER_HOST:ssh://ops@build-7:22".to_string()));
    }

    #[tokio::test]
    async fn output_lines_arrive_in_emission_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(
            dir.path(),
            r#"i=1
while [ $i -le 50 ]; do
  echo "line $i"
  i=$((i+1))
done"#,
        );
        let runner = ComposeRunner::new(stub.to_string_lossy());
        let stack = stack_in(dir.path());

        let (outcome, events) =
            run_collect(&runner, &stack, StackCommand::Up, &DeployTarget::Local).await;
        assert!(outcome.success);
        let lines = info_lines(&events);
        let expected: Vec<String> = (1..=50).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr_as_the_error_detail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(
            dir.path(),
            r#"echo "normal progress"
echo "no such image: ghost:latest" 1>&2
exit 3"#,
        );
        let runner = ComposeRunner::new(stub.to_string_lossy());
        let stack = stack_in(dir.path());

        let (outcome, events) =
            run_collect(&runner, &stack, StackCommand::Up, &DeployTarget::Local).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.stderr.contains("no such image"));

        match events.last() {
            Some(StreamEvent::Error { message }) => {
                assert!(message.contains("no such image: ghost:latest"));
            }
            other => panic!("expected terminal error event, got {other:?}"),
        }
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn bridge_is_torn_down_even_when_the_child_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(
            dir.path(),
            r#"echo "DOCKER_HOST:${DOCKER_HOST:-unset}"
exit 1"#,
        );
        let runner = ComposeRunner::new(stub.to_string_lossy());
        let stack = stack_in(dir.path());

        let target = DeployTarget::Agent {
            host: "127.0.0.1".to_string(),
            port: 9,
            secret: "s3cr3t".to_string(),
        };
        let (outcome, events) = run_collect(&runner, &stack, StackCommand::Up, &target).await;
        assert!(!outcome.success);

        let docker_host = info_lines(&events)
            .into_iter()
            .find(|l| l.starts_with("DOCKER_HOST:tcp://127.0.0.1:"))
            .expect("bridge address was exported");
        let addr: std::net::SocketAddr = docker_host
            .trim_start_matches("DOCKER_HOST:tcp://")
            .parse()
            .expect("bridge addr");
        // The listener must be gone; the port is reusable immediately.
        tokio::net::TcpListener::bind(addr)
            .await
            .expect("bridge port released after failed run");
    }

    #[tokio::test]
    async fn caller_disconnect_kills_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = write_stub(
            dir.path(),
            r#"echo "started"
sleep 30
echo "never""#,
        );
        let runner = ComposeRunner::new(stub.to_string_lossy().to_string());
        let stack = stack_in(dir.path());

        let (tx, mut rx) = mpsc::channel(8);
        let run_task = {
            let runner = runner.clone();
            let stack = stack.clone();
            tokio::spawn(async move {
                runner
                    .run(&stack, StackCommand::Up, &DeployTarget::Local, tx)
                    .await
            })
        };

        // Wait for the first output line, then walk away.
        loop {
            match rx.recv().await {
                Some(StreamEvent::Info { message }) if message == "started" => break,
                Some(_) => continue,
                None => panic!("stream ended before first line"),
            }
        }
        drop(rx);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), run_task)
            .await
            .expect("run returned promptly after disconnect")
            .expect("join");
        assert!(!outcome.success);
        assert!(outcome.stderr.contains("caller disconnected"));
    }
}
