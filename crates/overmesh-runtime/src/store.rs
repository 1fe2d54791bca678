//! Live connection registry
//!
//! The [`ConnectionStore`] tracks every established connection keyed by the
//! peer's session identifier and publishes establishment/loss events to
//! interested subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use overmesh_core::{Cvid, InstanceRole};

use crate::connection::Connection;

// ----------------------------------------------------------------------------
// Connection Events
// ----------------------------------------------------------------------------

/// Lifecycle events published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A handshake completed and the connection is registered
    Established {
        cvid: Cvid,
        role: InstanceRole,
        connection_id: u64,
    },
    /// A registered connection closed
    Lost {
        cvid: Cvid,
        role: InstanceRole,
        connection_id: u64,
    },
}

// ----------------------------------------------------------------------------
// Connection Store
// ----------------------------------------------------------------------------

/// Registry of live connections for one runtime.
pub struct ConnectionStore {
    connections: DashMap<Cvid, Arc<Connection>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionStore {
    /// Create an empty store with the given event fan-out capacity
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        ConnectionStore {
            connections: DashMap::new(),
            events,
        }
    }

    /// Look up the connection to a peer
    pub fn get(&self, cvid: Cvid) -> Option<Arc<Connection>> {
        self.connections.get(&cvid).map(|entry| entry.value().clone())
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of all registered connections
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscribe to establishment/loss events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Re-derive every connection's dispatch table from the current exelet
    /// registrations. Called after plugin load/unload; in-flight dispatch
    /// keeps using the snapshot it already holds.
    pub fn refresh_dispatch_tables(&self) {
        for entry in self.connections.iter() {
            entry.value().rebuild_table();
        }
    }

    pub(crate) fn insert(&self, connection: Arc<Connection>) {
        let Some(identity) = connection.identity() else {
            return;
        };
        self.connections.insert(identity.peer_cvid, connection.clone());
        let _ = self.events.send(ConnectionEvent::Established {
            cvid: identity.peer_cvid,
            role: identity.peer_role,
            connection_id: connection.id(),
        });
    }

    pub(crate) fn remove(&self, connection: &Arc<Connection>) {
        let Some(identity) = connection.identity() else {
            return;
        };
        let removed = self
            .connections
            .remove_if(&identity.peer_cvid, |_, existing| {
                existing.id() == connection.id()
            });
        if removed.is_some() {
            let _ = self.events.send(ConnectionEvent::Lost {
                cvid: identity.peer_cvid,
                role: identity.peer_role,
                connection_id: connection.id(),
            });
        }
    }
}
