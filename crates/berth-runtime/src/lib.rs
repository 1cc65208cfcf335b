mod bridge;
mod compose;

pub use bridge::ProxyBridge;
pub use compose::{ComposeOutcome, ComposeRunner, DeployTarget};
