use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of a stack's definition inside its working directory.
pub const COMPOSE_FILE_NAME: &str = "compose.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A named compose stack bound to a working directory holding its
/// definition file. `name` is used verbatim as the compose project name so
/// repeated operations always address the same resource set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: String,
    pub dir: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackCommand {
    Up,
    Down,
    Start,
    Stop,
    Restart,
}

impl StackCommand {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "up" => Some(StackCommand::Up),
            "down" => Some(StackCommand::Down),
            "start" => Some(StackCommand::Start),
            "stop" => Some(StackCommand::Stop),
            "restart" => Some(StackCommand::Restart),
            _ => None,
        }
    }

    /// The compose subcommand arguments for this operation.
    pub fn compose_args(self) -> &'static [&'static str] {
        match self {
            StackCommand::Up => &["up", "-d"],
            StackCommand::Down => &["down"],
            StackCommand::Start => &["start"],
            StackCommand::Stop => &["stop"],
            StackCommand::Restart => &["restart"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StackCommand::Up => "up",
            StackCommand::Down => "down",
            StackCommand::Start => "start",
            StackCommand::Stop => "stop",
            StackCommand::Restart => "restart",
        }
    }
}
