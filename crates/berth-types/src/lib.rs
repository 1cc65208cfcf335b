mod endpoint;
mod stack;
mod stream;

pub use endpoint::{Endpoint, EndpointKind, EndpointStatus, EndpointSummary, LOCAL_ENDPOINT_ID};
pub use stack::{EnvVar, StackCommand, StackSpec, COMPOSE_FILE_NAME};
pub use stream::{LineDecoder, StreamEvent};
