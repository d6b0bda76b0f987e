//! The serialized event loop that owns the membership registry.
//!
//! Exactly one task runs this loop; the registry therefore needs no locks.
//! Events from one source are applied in emission order, with no ordering
//! promise across sources.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::Config;

use super::events::{BrokerMessage, BusPublish};
use super::registry::Registry;

pub struct Broker {
    registry: Registry,
    publish: mpsc::Sender<BusPublish>,
    config: Arc<Config>,
}

impl Broker {
    pub fn new(config: Arc<Config>, publish: mpsc::Sender<BusPublish>) -> Self {
        Self {
            registry: Registry::new(),
            publish,
            config,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<BrokerMessage>) {
        tracing::info!("broker event loop started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            #[cfg(debug_assertions)]
            self.registry.check_invariants();
        }
        tracing::info!("broker event loop stopped");
    }

    fn handle(&mut self, msg: BrokerMessage) {
        match msg {
            BrokerMessage::Connect { conn } => {
                let session_id = conn.session_id.clone();
                self.registry.add_or_replace_session(conn);
                self.announce_session(&session_id);
            }
            BrokerMessage::Disconnect { conn_id } => {
                if self.registry.remove_connection(&conn_id) {
                    tracing::debug!(%conn_id, "connection removed");
                }
                // Otherwise the connection was already superseded or torn
                // down; nothing left to do.
            }
            BrokerMessage::MembershipUpdate { session_id, groups } => {
                let Some(conn_id) = self.registry.connection_for_session(&session_id) else {
                    tracing::warn!(%session_id, "membership update for unknown session");
                    return;
                };
                if groups.is_empty() && self.config.end_session_on_empty_update {
                    tracing::info!(%session_id, "empty membership update, ending session");
                    self.registry.remove_connection(&conn_id);
                } else {
                    self.registry
                        .set_groups(&conn_id, groups.into_iter().collect());
                }
            }
            BrokerMessage::GroupBroadcast { group, payload } => {
                let sent = self.registry.broadcast(&group, &payload);
                tracing::debug!(%group, sent, "group broadcast applied");
            }
            BrokerMessage::Inspect(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    /// Fire-and-forget new-session announcement onto the bus. Never blocks
    /// the event loop; a full publish queue loses the announcement.
    fn announce_session(&self, session_id: &str) {
        let announce = BusPublish {
            channel: self.config.channels.new_client.clone(),
            payload: Bytes::from(session_id.as_bytes().to_vec()),
        };
        if self.publish.try_send(announce).is_err() {
            tracing::warn!(%session_id, "publish queue unavailable, dropping new-session announcement");
        }
    }
}
