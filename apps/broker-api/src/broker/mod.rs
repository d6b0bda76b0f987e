//! The connection/group broker: a single serialized owner of the membership
//! registry, fed through a mailbox by the transport and bus layers.

pub mod engine;
pub mod events;
pub mod registry;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

use engine::Broker;
use events::{BrokerMessage, BusPublish};
use registry::{ConnectionHandle, ConnectionId, RegistrySnapshot};

/// Capacity of the broker mailbox shared by all event sources.
const MAILBOX_CAPACITY: usize = 1024;

/// Cloneable handle for feeding events into the broker's event loop.
///
/// Per-handle sends are FIFO; no ordering is guaranteed across handles.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerMessage>,
}

/// Spawn the broker event loop and return a handle to it.
pub fn spawn(config: Arc<Config>, publish: mpsc::Sender<BusPublish>) -> BrokerHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    tokio::spawn(Broker::new(config, publish).run(rx));
    BrokerHandle { tx }
}

impl BrokerHandle {
    /// Register a freshly upgraded connection, superseding any live connection
    /// for the same session.
    pub async fn connect(&self, conn: ConnectionHandle) {
        let _ = self.tx.send(BrokerMessage::Connect { conn }).await;
    }

    /// Tear down a connection. Safe to call more than once per connection.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(BrokerMessage::Disconnect { conn_id }).await;
    }

    /// Replace a session's group membership with exactly `groups`.
    pub async fn membership_update(&self, session_id: String, groups: Vec<String>) {
        let _ = self
            .tx
            .send(BrokerMessage::MembershipUpdate { session_id, groups })
            .await;
    }

    /// Fan a payload out to every current member of `group`.
    pub async fn group_broadcast(&self, group: String, payload: Bytes) {
        let _ = self
            .tx
            .send(BrokerMessage::GroupBroadcast { group, payload })
            .await;
    }

    /// Read-only registry snapshot. `None` if the broker is gone.
    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(BrokerMessage::Inspect(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}
