//! Tagged units of work consumed by the broker, plus outbound bus publishes.

use bytes::Bytes;
use tokio::sync::oneshot;

use super::registry::{ConnectionHandle, ConnectionId, RegistrySnapshot};

/// A single unit of work for the broker's serialized event loop.
pub enum BrokerMessage {
    /// A transport handshake completed. Registers the connection, superseding
    /// any live connection already registered for the same session.
    Connect { conn: ConnectionHandle },
    /// A connection pump terminated. Idempotent: a stale or repeated id is a
    /// no-op.
    Disconnect { conn_id: ConnectionId },
    /// The control plane pushed a new group list for a session. Replace
    /// semantics, not merge; an empty list detaches the session from all
    /// groups.
    MembershipUpdate {
        session_id: String,
        groups: Vec<String>,
    },
    /// Fan a payload out to every current member of a group. Unknown groups
    /// are silently dropped.
    GroupBroadcast { group: String, payload: Bytes },
    /// Read-only registry snapshot for the introspection endpoints.
    Inspect(oneshot::Sender<RegistrySnapshot>),
}

/// An outbound publish destined for the external bus.
#[derive(Debug, Clone)]
pub struct BusPublish {
    pub channel: String,
    pub payload: Bytes,
}
