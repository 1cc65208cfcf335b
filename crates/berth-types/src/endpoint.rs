use serde::{Deserialize, Serialize};

/// Reserved id of the endpoint bound to the in-process Docker socket.
pub const LOCAL_ENDPOINT_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Local,
    Tcp,
    Agent,
    Ssh,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Local => "local",
            EndpointKind::Tcp => "tcp",
            EndpointKind::Agent => "agent",
            EndpointKind::Ssh => "ssh",
        }
    }
}

/// Persisted endpoint descriptor. The `secret` field is only ever used to
/// build a client; it must not appear in listing responses (see
/// [`EndpointSummary`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Endpoint {
    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            has_secret: self.secret.is_some(),
        }
    }
}

/// Sanitized projection of an [`Endpoint`] safe for listing responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSummary {
    pub id: String,
    pub name: String,
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub has_secret: bool,
}

/// Result of the most recent reachability probe for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub online: bool,
    pub checked_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_never_carries_the_secret() {
        let endpoint = Endpoint {
            id: "ep-1".to_string(),
            name: "build host".to_string(),
            kind: EndpointKind::Agent,
            host: Some("10.0.0.5".to_string()),
            port: Some(9002),
            username: None,
            key_path: None,
            secret: Some("s3cr3t".to_string()),
        };
        let summary = endpoint.summary();
        assert!(summary.has_secret);
        let raw = serde_json::to_string(&summary).expect("serialize");
        assert!(!raw.contains("s3cr3t"));
    }

    #[test]
    fn unknown_kind_fails_deserialization() {
        let raw = r#"{"id":"x","name":"x","kind":"teleport"}"#;
        assert!(serde_json::from_str::<Endpoint>(raw).is_err());
    }
}
