use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use berth_core::resolve_state_dir;
use berth_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use berth_server::{build_state, serve};

#[derive(Parser, Debug)]
#[command(name = "berth-manager")]
#[command(about = "Remote Docker host and stack manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3500)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Print the resolved configuration and endpoint list, then exit.
    Status {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Manager, &state_dir.join("logs"))?;
            info!("manager logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(
                "starting berth-manager on http://{addr} (state dir {})",
                state_dir.display()
            );

            let state = build_state(&state_dir).await?;
            info!(
                "loaded {} endpoint(s), {} stack(s)",
                state.registry.list().await.len(),
                state.stacks.list().await.len()
            );
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Manager,
                ObservabilityEvent {
                    event: "manager.startup.ready",
                    component: "manager.main",
                    endpoint_id: None,
                    stack: None,
                    operation: None,
                    status: Some("ok"),
                    detail: Some(&format!("listening on {addr}")),
                },
            );
            serve(addr, state).await?;
        }
        Command::Status { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let state = build_state(&state_dir).await?;
            let summary = serde_json::json!({
                "state_dir": state_dir.display().to_string(),
                "compose_bin": state.config.compose_bin,
                "endpoints": state.registry.list().await,
                "stacks": state.stacks.list().await,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
