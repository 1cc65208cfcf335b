use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Manager,
    Agent,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Manager => "manager",
            ProcessKind::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub initialized_at: DateTime<Utc>,
}

/// Structured event emitted alongside free-form log lines so operational
/// tooling can grep one stable shape.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub endpoint_id: Option<&'a str>,
    pub stack: Option<&'a str>,
    pub operation: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Console + JSONL file logging for one process. The returned guard must
/// stay alive for the file layer to flush.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let file_appender =
        tracing_appender::rolling::daily(logs_dir, format!("berth-{}.jsonl", process.as_str()));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .try_init()
        .ok();

    Ok((
        guard,
        LoggingInitInfo {
            process: process.as_str().to_string(),
            logs_dir: logs_dir.to_string_lossy().to_string(),
            initialized_at: Utc::now(),
        },
    ))
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "berth.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            endpoint_id = event.endpoint_id.unwrap_or(""),
            stack = event.stack.unwrap_or(""),
            operation = event.operation.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "berth.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            endpoint_id = event.endpoint_id.unwrap_or(""),
            stack = event.stack.unwrap_or(""),
            operation = event.operation.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "berth.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            endpoint_id = event.endpoint_id.unwrap_or(""),
            stack = event.stack.unwrap_or(""),
            operation = event.operation.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}
