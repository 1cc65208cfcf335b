use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use berth_client::{EngineClient, SshTarget, DEFAULT_ENGINE_SOCKET};
use berth_types::{Endpoint, EndpointKind, EndpointSummary, LOCAL_ENDPOINT_ID};

const DEFAULT_TCP_PORT: u16 = 2375;
const DEFAULT_AGENT_PORT: u16 = 9002;
const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryError {
    NotFound { id: String },
    /// The local endpoint's transport binding cannot be edited or removed.
    LocalEndpointProtected,
    InvalidEndpoint { detail: String },
    /// The endpoint exists but no working client could be built for it.
    Unbound { id: String, detail: String },
}

/// Result of a successful mutation. `persist_warning` is set when the
/// change applied in memory but could not be written to the state file; it
/// will not survive a restart.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub endpoint: EndpointSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_warning: Option<String>,
}

/// Owns the id -> (descriptor, client) mapping. Descriptors are persisted
/// (secrets included) to one JSON state file after every successful
/// mutation; clients are rebuilt whenever the underlying fields change and
/// are only ever handed out through [`EndpointRegistry::resolve`].
#[derive(Clone)]
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<String, Endpoint>>>,
    clients: Arc<RwLock<HashMap<String, Arc<EngineClient>>>>,
    state_file: Arc<PathBuf>,
    local_socket: Arc<PathBuf>,
}

impl EndpointRegistry {
    pub async fn open(
        state_file: PathBuf,
        local_socket: PathBuf,
        local_display_host: Option<String>,
    ) -> Self {
        let mut endpoints = load_state(&state_file);

        // The local endpoint always exists and is always bound to the
        // in-process engine socket, whatever the state file says. A corrupt
        // or hand-edited entry must not brick local access.
        let mut dirty = false;
        match endpoints.get_mut(LOCAL_ENDPOINT_ID) {
            Some(local) => {
                if local.kind != EndpointKind::Local {
                    local.kind = EndpointKind::Local;
                    dirty = true;
                }
                if let Some(host) = &local_display_host {
                    if local.host.as_deref() != Some(host.as_str()) {
                        local.host = Some(host.clone());
                        dirty = true;
                    }
                }
            }
            None => {
                endpoints.insert(
                    LOCAL_ENDPOINT_ID.to_string(),
                    Endpoint {
                        id: LOCAL_ENDPOINT_ID.to_string(),
                        name: "Local".to_string(),
                        kind: EndpointKind::Local,
                        host: local_display_host.clone(),
                        port: None,
                        username: None,
                        key_path: None,
                        secret: None,
                    },
                );
                dirty = true;
            }
        }

        let mut clients = HashMap::new();
        for (id, endpoint) in &endpoints {
            match build_client(endpoint, &local_socket) {
                Ok(client) => {
                    clients.insert(id.clone(), Arc::new(client));
                }
                Err(detail) => {
                    // Malformed entries degrade to unreachable instead of
                    // failing the whole registry load.
                    tracing::warn!("endpoint {id} has no usable client: {detail}");
                }
            }
        }

        let registry = Self {
            endpoints: Arc::new(RwLock::new(endpoints)),
            clients: Arc::new(RwLock::new(clients)),
            state_file: Arc::new(state_file),
            local_socket: Arc::new(local_socket),
        };
        if dirty {
            if let Err(err) = registry.persist().await {
                tracing::error!("failed to persist endpoint state: {err}");
            }
        }
        registry
    }

    pub async fn list(&self) -> Vec<EndpointSummary> {
        let mut rows = self
            .endpoints
            .read()
            .await
            .values()
            .map(Endpoint::summary)
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            // Local first, then by name.
            let a_local = a.id == LOCAL_ENDPOINT_ID;
            let b_local = b.id == LOCAL_ENDPOINT_ID;
            b_local.cmp(&a_local).then_with(|| a.name.cmp(&b.name))
        });
        rows
    }

    /// Full descriptor including the secret. For internal wiring (deploy
    /// targets, client rebuilds) only; listing endpoints must go through
    /// [`EndpointRegistry::list`].
    pub async fn descriptor(&self, id: &str) -> Option<Endpoint> {
        self.endpoints.read().await.get(id).cloned()
    }

    pub async fn resolve(&self, id: &str) -> Result<Arc<EngineClient>, RegistryError> {
        if let Some(client) = self.clients.read().await.get(id) {
            return Ok(client.clone());
        }
        if self.endpoints.read().await.contains_key(id) {
            return Err(RegistryError::Unbound {
                id: id.to_string(),
                detail: "endpoint descriptor is malformed; edit it to rebuild the client"
                    .to_string(),
            });
        }
        Err(RegistryError::NotFound { id: id.to_string() })
    }

    pub async fn upsert(&self, mut endpoint: Endpoint) -> Result<MutationOutcome, RegistryError> {
        normalize(&mut endpoint);
        validate(&endpoint)?;
        if endpoint.id == LOCAL_ENDPOINT_ID && endpoint.kind != EndpointKind::Local {
            return Err(RegistryError::LocalEndpointProtected);
        }

        let client = build_client(&endpoint, &self.local_socket)
            .map_err(|detail| RegistryError::InvalidEndpoint { detail })?;

        self.endpoints
            .write()
            .await
            .insert(endpoint.id.clone(), endpoint.clone());
        self.clients
            .write()
            .await
            .insert(endpoint.id.clone(), Arc::new(client));

        // In-memory state stays authoritative for this process lifetime;
        // a persist failure only means the change may not survive restart.
        let persist_warning = self.persist_with_warning().await;
        Ok(MutationOutcome {
            endpoint: endpoint.summary(),
            persist_warning,
        })
    }

    pub async fn remove(&self, id: &str) -> Result<Option<String>, RegistryError> {
        if id == LOCAL_ENDPOINT_ID {
            return Err(RegistryError::LocalEndpointProtected);
        }
        let removed = self.endpoints.write().await.remove(id);
        if removed.is_none() {
            return Err(RegistryError::NotFound { id: id.to_string() });
        }
        self.clients.write().await.remove(id);
        Ok(self.persist_with_warning().await)
    }

    async fn persist_with_warning(&self) -> Option<String> {
        match self.persist().await {
            Ok(()) => None,
            Err(err) => {
                tracing::error!("failed to persist endpoint state: {err}");
                Some(format!("change applied but not persisted: {err}"))
            }
        }
    }

    async fn persist(&self) -> Result<(), String> {
        let snapshot = self.endpoints.read().await.clone();
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| err.to_string())?;
        }
        let payload = serde_json::to_string_pretty(&snapshot).map_err(|err| err.to_string())?;
        tokio::fs::write(self.state_file.as_path(), payload)
            .await
            .map_err(|err| err.to_string())
    }
}

fn load_state(path: &Path) -> HashMap<String, Endpoint> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    serde_json::from_str::<HashMap<String, Endpoint>>(&raw).unwrap_or_default()
}

fn normalize(endpoint: &mut Endpoint) {
    endpoint.id = endpoint.id.trim().to_string();
    endpoint.name = endpoint.name.trim().to_string();
    if endpoint.name.is_empty() {
        endpoint.name = endpoint.id.clone();
    }
    if endpoint.port.is_none() {
        endpoint.port = match endpoint.kind {
            EndpointKind::Tcp => Some(DEFAULT_TCP_PORT),
            EndpointKind::Agent => Some(DEFAULT_AGENT_PORT),
            EndpointKind::Ssh => Some(DEFAULT_SSH_PORT),
            EndpointKind::Local => None,
        };
    }
}

fn validate(endpoint: &Endpoint) -> Result<(), RegistryError> {
    let invalid = |detail: &str| {
        Err(RegistryError::InvalidEndpoint {
            detail: detail.to_string(),
        })
    };
    if endpoint.id.is_empty() {
        return invalid("endpoint id is required");
    }
    match endpoint.kind {
        EndpointKind::Local => {
            if endpoint.id != LOCAL_ENDPOINT_ID {
                return invalid("only the reserved local endpoint may use kind=local");
            }
        }
        EndpointKind::Tcp => {
            if endpoint.host.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("tcp endpoints require a host");
            }
        }
        EndpointKind::Agent => {
            if endpoint.host.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("agent endpoints require a host");
            }
            if endpoint.secret.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("agent endpoints require a shared secret");
            }
        }
        EndpointKind::Ssh => {
            if endpoint.host.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("ssh endpoints require a host");
            }
            if endpoint.username.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("ssh endpoints require a username");
            }
            if endpoint.key_path.as_deref().unwrap_or("").trim().is_empty() {
                return invalid("ssh endpoints require a private key path");
            }
        }
    }
    Ok(())
}

fn build_client(endpoint: &Endpoint, local_socket: &Path) -> Result<EngineClient, String> {
    match endpoint.kind {
        EndpointKind::Local => Ok(EngineClient::local(local_socket)),
        EndpointKind::Tcp => {
            let host = required(&endpoint.host, "host")?;
            Ok(EngineClient::tcp(
                host,
                endpoint.port.unwrap_or(DEFAULT_TCP_PORT),
            ))
        }
        EndpointKind::Agent => {
            let host = required(&endpoint.host, "host")?;
            let secret = required(&endpoint.secret, "secret")?;
            Ok(EngineClient::agent(
                host,
                endpoint.port.unwrap_or(DEFAULT_AGENT_PORT),
                secret,
            ))
        }
        EndpointKind::Ssh => {
            let host = required(&endpoint.host, "host")?;
            let username = required(&endpoint.username, "username")?;
            let key_path = required(&endpoint.key_path, "key_path")?;
            Ok(EngineClient::ssh(SshTarget {
                host,
                port: endpoint.port.unwrap_or(DEFAULT_SSH_PORT),
                username,
                key_path: PathBuf::from(key_path),
                socket_path: DEFAULT_ENGINE_SOCKET.to_string(),
            }))
        }
    }
}

fn required(field: &Option<String>, name: &str) -> Result<String, String> {
    match field.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(format!("missing {name}")),
    }
}
