pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod maintenance;
pub mod protocol;
pub mod registry;
pub mod topics;

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Type alias for the sender half of a connection's outbound channel.
/// The writer task drains this into the WebSocket sink; anything holding a
/// clone can push frames to that client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Process-unique connection identifier, assigned at registration and never
/// reused. A client that disconnects must register again for a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
