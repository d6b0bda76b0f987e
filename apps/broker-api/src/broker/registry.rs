//! Membership registry: the authoritative session/connection/group maps.
//!
//! Not internally synchronized. The broker's event loop owns the only
//! instance and serializes every mutation; nothing else touches it.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Unique id of one live transport endpoint (`conn_`-prefixed ULID).
pub type ConnectionId = String;

/// Capacity of each connection's outbound queue. A member whose queue is full
/// has broadcasts dropped rather than stalling the broker.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Why an enqueue onto a connection's outbound queue did not happen.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The peer is draining too slowly; the payload was dropped for it.
    Full,
    /// The write loop already exited; a Disconnect event is on its way.
    Closed,
}

/// Non-owning reference to one live connection: its identity and the sending
/// half of its outbound queue. The pump owns the receiving half; dropping
/// this handle is what closes the queue.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub session_id: String,
    outbound: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(session_id: String, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: groupcast_common::id::prefixed_ulid(groupcast_common::id::prefix::CONNECTION),
            session_id,
            outbound,
        }
    }

    fn enqueue(&self, payload: Bytes) -> Result<(), EnqueueError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// One registered connection: its handle plus the groups it belongs to.
struct Member {
    handle: ConnectionHandle,
    groups: HashSet<String>,
}

/// Read-only view of the registry, taken in one pass for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    /// All registered session ids, sorted.
    pub sessions: Vec<String>,
    /// Session id to the sorted list of groups its connection is in.
    pub clients: BTreeMap<String, Vec<String>>,
    /// Group name to the sorted list of member session ids.
    pub groups: BTreeMap<String, Vec<String>>,
}

/// The session/connection/group maps, held bidirectionally: each member
/// records its groups, each group records its member connections. Every
/// mutator maintains both directions together.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<String, ConnectionId>,
    connections: HashMap<ConnectionId, Member>,
    groups: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` for its session. A connection already registered for
    /// the same session is fully torn down first.
    pub fn add_or_replace_session(&mut self, conn: ConnectionHandle) {
        if let Some(old_id) = self.sessions.get(&conn.session_id).cloned() {
            tracing::info!(
                session_id = %conn.session_id,
                old_conn = %old_id,
                new_conn = %conn.id,
                "superseding existing connection"
            );
            self.remove_connection(&old_id);
        }
        self.sessions.insert(conn.session_id.clone(), conn.id.clone());
        self.connections.insert(
            conn.id.clone(),
            Member {
                handle: conn,
                groups: HashSet::new(),
            },
        );
    }

    /// Replace the full membership of a connection with exactly `new_groups`.
    /// Groups it leaves are deleted once empty; groups it joins are created
    /// on first reference. An empty set detaches it from every group while
    /// keeping the session registered.
    pub fn set_groups(&mut self, conn_id: &ConnectionId, new_groups: HashSet<String>) {
        let Some(member) = self.connections.get_mut(conn_id) else {
            tracing::warn!(%conn_id, "set_groups on unknown connection");
            return;
        };
        let old = std::mem::replace(&mut member.groups, new_groups.clone());

        for name in old.difference(&new_groups) {
            remove_group_member(&mut self.groups, name, conn_id);
        }
        for name in new_groups.difference(&old) {
            self.groups
                .entry(name.clone())
                .or_default()
                .insert(conn_id.clone());
        }
    }

    /// Remove a connection from every group it belongs to (deleting groups
    /// that become empty) and drop its session mapping — unless the session
    /// has already been superseded by a newer connection. Returns whether the
    /// connection was live; a repeated or stale id is a no-op.
    pub fn remove_connection(&mut self, conn_id: &ConnectionId) -> bool {
        let Some(member) = self.connections.remove(conn_id) else {
            return false;
        };
        for name in &member.groups {
            remove_group_member(&mut self.groups, name, conn_id);
        }
        // Identity guard: only clear the session entry if it still points at
        // this connection (a stale disconnect can race a reconnect).
        if self.sessions.get(&member.handle.session_id) == Some(conn_id) {
            self.sessions.remove(&member.handle.session_id);
        }
        // Dropping `member` closes the outbound queue; the write loop answers
        // with a close frame and both pump halves unwind.
        true
    }

    /// Enqueue `payload` once onto every member of `group`. An unknown group
    /// is a no-op — groups come and go. One slow or dead member never delays
    /// delivery to the others. Returns the number of successful enqueues.
    pub fn broadcast(&self, group: &str, payload: &Bytes) -> usize {
        let Some(members) = self.groups.get(group) else {
            tracing::debug!(%group, "broadcast to unknown group dropped");
            return 0;
        };
        let mut sent = 0;
        for conn_id in members {
            let Some(member) = self.connections.get(conn_id) else {
                continue;
            };
            match member.handle.enqueue(payload.clone()) {
                Ok(()) => sent += 1,
                Err(EnqueueError::Full) => {
                    tracing::warn!(
                        %group,
                        session_id = %member.handle.session_id,
                        "outbound queue full, dropping payload for this member"
                    );
                }
                Err(EnqueueError::Closed) => {
                    tracing::debug!(
                        %group,
                        session_id = %member.handle.session_id,
                        "outbound queue closed, disconnect pending"
                    );
                }
            }
        }
        sent
    }

    /// The live connection registered for `session_id`, if any.
    pub fn connection_for_session(&self, session_id: &str) -> Option<ConnectionId> {
        self.sessions.get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One-pass read-only copy of the maps for the introspection endpoints.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut sessions: Vec<String> = self.sessions.keys().cloned().collect();
        sessions.sort();

        let mut clients = BTreeMap::new();
        for member in self.connections.values() {
            let mut groups: Vec<String> = member.groups.iter().cloned().collect();
            groups.sort();
            clients.insert(member.handle.session_id.clone(), groups);
        }

        let mut groups = BTreeMap::new();
        for (name, members) in &self.groups {
            let mut ids: Vec<String> = members
                .iter()
                .filter_map(|id| self.connections.get(id))
                .map(|m| m.handle.session_id.clone())
                .collect();
            ids.sort();
            groups.insert(name.clone(), ids);
        }

        RegistrySnapshot {
            sessions,
            clients,
            groups,
        }
    }

    /// Assert the structural invariants: membership is bidirectional, no
    /// group is empty, and every session maps to exactly one live connection.
    /// Violations are programming errors, not recoverable conditions.
    pub fn check_invariants(&self) {
        for (name, members) in &self.groups {
            assert!(!members.is_empty(), "group {name} survived with no members");
            for conn_id in members {
                let member = self
                    .connections
                    .get(conn_id)
                    .unwrap_or_else(|| panic!("group {name} references dead connection {conn_id}"));
                assert!(
                    member.groups.contains(name),
                    "connection {conn_id} missing back-reference to group {name}"
                );
            }
        }
        for (conn_id, member) in &self.connections {
            for name in &member.groups {
                assert!(
                    self.groups.get(name).is_some_and(|m| m.contains(conn_id)),
                    "group {name} missing member {conn_id}"
                );
            }
            assert_eq!(
                self.sessions.get(&member.handle.session_id),
                Some(conn_id),
                "session {} not mapped to its live connection",
                member.handle.session_id
            );
        }
        assert_eq!(
            self.sessions.len(),
            self.connections.len(),
            "session and connection maps out of sync"
        );
    }
}

/// Drop `conn_id` from a group's member set, deleting the group the moment it
/// empties. Groups never persist with zero members.
fn remove_group_member(
    groups: &mut HashMap<String, HashSet<ConnectionId>>,
    name: &str,
    conn_id: &ConnectionId,
) {
    if let Some(members) = groups.get_mut(name) {
        members.remove(conn_id);
        if members.is_empty() {
            groups.remove(name);
            tracing::debug!(group = %name, "group emptied, removed");
        }
    }
}
