use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use berth_agent::{load_or_create_secret, serve, AgentConfig};
use berth_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};

#[derive(Parser, Debug)]
#[command(name = "berth-agent")]
#[command(about = "Authenticating reverse proxy for a Docker engine socket")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:9002")]
    listen: SocketAddr,
    /// Docker engine socket to forward to.
    #[arg(long, default_value = berth_client::DEFAULT_ENGINE_SOCKET)]
    engine_socket: PathBuf,
    /// File holding the shared secret; created with a fresh secret when
    /// absent. BERTH_AGENT_SECRET overrides it.
    #[arg(long)]
    secret_file: Option<PathBuf>,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

fn default_secret_file() -> PathBuf {
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("berth").join("agent_secret");
    }
    PathBuf::from("agent_secret")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs_dir = cli
        .logs_dir
        .unwrap_or_else(|| default_secret_file().with_file_name("logs"));
    let (_log_guard, log_info) = init_process_logging(ProcessKind::Agent, &logs_dir)?;
    info!("agent logging initialized: {:?}", log_info);

    let secret_file = cli.secret_file.unwrap_or_else(default_secret_file);
    let material = load_or_create_secret(&secret_file)
        .with_context(|| format!("load agent secret from {}", secret_file.display()))?;
    info!(
        "agent secret loaded from {} ({})",
        material.file_path.display(),
        material.source
    );

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    info!(
        "forwarding to engine socket {}",
        cli.engine_socket.display()
    );
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Agent,
        ObservabilityEvent {
            event: "agent.startup.ready",
            component: "agent.main",
            endpoint_id: None,
            stack: None,
            operation: None,
            status: Some("ok"),
            detail: Some(&format!("listening on {}", cli.listen)),
        },
    );

    serve(
        listener,
        AgentConfig {
            engine_socket: cli.engine_socket,
            secret: material.secret,
        },
    )
    .await
}
