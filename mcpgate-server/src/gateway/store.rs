// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Connection record store.
//!
//! Owned by the gateway task and only touched between awaits, so it needs no
//! locking. At most one record exists per `(owner, host, port)`; records are
//! removed as soon as they reach a terminal outcome.

use chrono::{DateTime, Utc};
use mcpgate_core::{new_connection_id, ConnectionStatus, RemoteEndpoint};
use std::collections::HashMap;
use tokio_util::time::delay_queue;

use super::session::SessionHandle;
use super::SocketId;

#[derive(Debug)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub owner_id: String,
    pub endpoint: RemoteEndpoint,
    pub client_id: Option<String>,
    pub status: ConnectionStatus,
    /// Open SSE stream, if any. Replacing it drops (closes) the old one.
    pub session: Option<SessionHandle>,
    pub established_at: Option<DateTime<Utc>>,
    /// Failed acquisition attempts for the current establishment.
    pub attempt_count: u32,
    /// Sockets that asked for this connection; each receives its
    /// asynchronous notifications.
    pub subscribers: Vec<SocketId>,
    /// Bumped whenever a new session or probe cycle starts; stale events
    /// carrying an older generation are ignored.
    pub generation: u64,
    pub probing: bool,
    pub acquisition_timer: Option<delay_queue::Key>,
    pub backoff_timer: Option<delay_queue::Key>,
    pub health_timer: Option<delay_queue::Key>,
}

impl ConnectionRecord {
    fn new(owner_id: String, endpoint: RemoteEndpoint, socket: SocketId) -> Self {
        Self {
            connection_id: new_connection_id(),
            owner_id,
            endpoint,
            client_id: None,
            status: ConnectionStatus::Connecting,
            session: None,
            established_at: None,
            attempt_count: 0,
            subscribers: vec![socket],
            generation: 0,
            probing: false,
            acquisition_timer: None,
            backoff_timer: None,
            health_timer: None,
        }
    }

    pub fn subscribe(&mut self, socket: SocketId) {
        if !self.subscribers.contains(&socket) {
            self.subscribers.push(socket);
        }
    }

    /// Every subscriber plus `requester`, without duplicates.
    pub fn audience(&self, requester: SocketId) -> Vec<SocketId> {
        let mut sockets = self.subscribers.clone();
        if !sockets.contains(&requester) {
            sockets.push(requester);
        }
        sockets
    }

    /// Ready to forward tool calls.
    pub fn usable_client_id(&self) -> Option<&str> {
        if self.status.is_ready() {
            self.client_id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Created(String),
    Existing(String),
}

impl Entry {
    pub fn connection_id(&self) -> &str {
        match self {
            Entry::Created(id) | Entry::Existing(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStore {
    records: HashMap<String, ConnectionRecord>,
    by_endpoint: HashMap<(String, RemoteEndpoint), String>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live record for the triple if there is one, otherwise
    /// creates a new record in `connecting`.
    pub fn create(&mut self, owner_id: &str, endpoint: &RemoteEndpoint, socket: SocketId) -> Entry {
        let key = (owner_id.to_string(), endpoint.clone());
        if let Some(id) = self.by_endpoint.get(&key) {
            if let Some(record) = self.records.get(id) {
                if !record.status.is_terminal() {
                    return Entry::Existing(id.clone());
                }
            }
        }

        let record = ConnectionRecord::new(owner_id.to_string(), endpoint.clone(), socket);
        let id = record.connection_id.clone();
        self.by_endpoint.insert(key, id.clone());
        self.records.insert(id.clone(), record);
        Entry::Created(id)
    }

    pub fn get(&self, connection_id: &str) -> Option<&ConnectionRecord> {
        self.records.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(connection_id)
    }

    pub fn update<R>(
        &mut self,
        connection_id: &str,
        mutator: impl FnOnce(&mut ConnectionRecord) -> R,
    ) -> Option<R> {
        self.records.get_mut(connection_id).map(mutator)
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<ConnectionRecord> {
        let record = self.records.remove(connection_id)?;
        let key = (record.owner_id.clone(), record.endpoint.clone());
        if self.by_endpoint.get(&key).map(String::as_str) == Some(connection_id) {
            self.by_endpoint.remove(&key);
        }
        Some(record)
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.connection_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.by_endpoint.clear();
        self.records.drain().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint::new("10.0.0.5", 8080)
    }

    #[test]
    fn test_create_is_idempotent_per_triple() {
        let mut store = ConnectionStore::new();
        let first = store.create("alice", &endpoint(), SocketId(1));
        let second = store.create("alice", &endpoint(), SocketId(2));

        assert!(matches!(first, Entry::Created(_)));
        assert_eq!(second, Entry::Existing(first.connection_id().to_string()));
        assert_eq!(store.len(), 1);

        // Different owner or port means a different record
        let other_owner = store.create("bob", &endpoint(), SocketId(3));
        let other_port = store.create("alice", &RemoteEndpoint::new("10.0.0.5", 8081), SocketId(1));
        assert!(matches!(other_owner, Entry::Created(_)));
        assert!(matches!(other_port, Entry::Created(_)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_remove_frees_the_triple() {
        let mut store = ConnectionStore::new();
        let first = store.create("alice", &endpoint(), SocketId(1));
        let removed = store.remove(first.connection_id()).unwrap();
        assert_eq!(removed.status, ConnectionStatus::Connecting);
        assert!(store.get(first.connection_id()).is_none());

        let again = store.create("alice", &endpoint(), SocketId(1));
        assert!(matches!(again, Entry::Created(_)));
        assert_ne!(again.connection_id(), first.connection_id());
    }

    #[test]
    fn test_terminal_record_is_not_reused() {
        let mut store = ConnectionStore::new();
        let first = store.create("alice", &endpoint(), SocketId(1));
        store.update(first.connection_id(), |r| {
            r.status = ConnectionStatus::Disconnected
        });

        let second = store.create("alice", &endpoint(), SocketId(1));
        assert!(matches!(second, Entry::Created(_)));
    }

    #[test]
    fn test_subscribers_are_deduplicated() {
        let mut store = ConnectionStore::new();
        let entry = store.create("alice", &endpoint(), SocketId(1));
        let record = store.get_mut(entry.connection_id()).unwrap();

        record.subscribe(SocketId(2));
        record.subscribe(SocketId(1));
        record.subscribe(SocketId(2));
        assert_eq!(record.subscribers, vec![SocketId(1), SocketId(2)]);

        assert_eq!(record.audience(SocketId(2)), vec![SocketId(1), SocketId(2)]);
        assert_eq!(
            record.audience(SocketId(3)),
            vec![SocketId(1), SocketId(2), SocketId(3)]
        );
    }

    #[test]
    fn test_list_by_owner_and_usable_client_id() {
        let mut store = ConnectionStore::new();
        let a1 = store.create("alice", &endpoint(), SocketId(1));
        let a2 = store.create("alice", &RemoteEndpoint::new("mcp.local", 3000), SocketId(1));
        store.create("bob", &endpoint(), SocketId(2));

        let mut owned = store.list_by_owner("alice");
        owned.sort();
        let mut expected = vec![a1.connection_id().to_string(), a2.connection_id().to_string()];
        expected.sort();
        assert_eq!(owned, expected);

        let record = store.get_mut(a1.connection_id()).unwrap();
        record.client_id = Some("abc123".to_string());
        assert_eq!(record.usable_client_id(), None);
        record.status = ConnectionStatus::Connected;
        assert_eq!(record.usable_client_id(), Some("abc123"));

        assert_eq!(store.drain().len(), 3);
        assert!(store.is_empty());
    }
}
