use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

use berth_client::DEFAULT_ENGINE_SOCKET;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Path of the local engine socket the `local` endpoint binds to.
    #[serde(default = "default_local_socket")]
    pub local_socket: String,
    /// Display host for the local endpoint; transport binding is unaffected.
    #[serde(default)]
    pub local_display_host: Option<String>,
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    /// Binary invoked for stack operations; `compose` is appended as the
    /// first argument.
    #[serde(default = "default_compose_bin")]
    pub compose_bin: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_socket: default_local_socket(),
            local_display_host: None,
            status_poll_secs: default_status_poll_secs(),
            compose_bin: default_compose_bin(),
        }
    }
}

fn default_local_socket() -> String {
    DEFAULT_ENGINE_SOCKET.to_string()
}

fn default_status_poll_secs() -> u64 {
    30
}

fn default_compose_bin() -> String {
    "docker".to_string()
}

/// Loads `config.json` from the state dir and overlays `BERTH_*`
/// environment variables on top.
pub async fn load_manager_config(state_dir: &Path) -> anyhow::Result<ManagerConfig> {
    let config_path = state_dir.join("config.json");
    let mut merged = if config_path.exists() {
        let raw = fs::read_to_string(&config_path).await?;
        serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object())
    } else {
        empty_object()
    };
    deep_merge(&mut merged, &env_layer());
    Ok(serde_json::from_value(merged).unwrap_or_default())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn env_layer() -> Value {
    let mut layer = Map::new();
    if let Ok(value) = std::env::var("BERTH_LOCAL_SOCKET") {
        if !value.trim().is_empty() {
            layer.insert("local_socket".to_string(), Value::String(value));
        }
    }
    if let Ok(value) = std::env::var("BERTH_LOCAL_DISPLAY_HOST") {
        if !value.trim().is_empty() {
            layer.insert("local_display_host".to_string(), Value::String(value));
        }
    }
    if let Ok(value) = std::env::var("BERTH_STATUS_POLL_SECS") {
        if let Ok(parsed) = value.trim().parse::<u64>() {
            layer.insert("status_poll_secs".to_string(), Value::from(parsed));
        }
    }
    if let Ok(value) = std::env::var("BERTH_COMPOSE_BIN") {
        if !value.trim().is_empty() {
            layer.insert("compose_bin".to_string(), Value::String(value));
        }
    }
    Value::Object(layer)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay) => {
            *base_slot = overlay.clone();
        }
    }
}
