use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

mod config;
mod registry;
mod stacks;
mod status;

pub use config::{load_manager_config, ManagerConfig};
pub use registry::{EndpointRegistry, MutationOutcome, RegistryError};
pub use stacks::StackStore;
pub use status::{run_status_poller, StatusBoard};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State directory precedence: explicit flag, `BERTH_STATE_DIR`, platform
/// data dir, then a dotdir fallback.
pub fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("BERTH_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("berth");
    }
    dirs::home_dir()
        .map(|home| home.join(".berth"))
        .unwrap_or_else(|| PathBuf::from(".berth"))
}
