//! External persistence collaborator
//!
//! The runtime consults a [`Store`] to resolve node metadata such as
//! listener configuration. Persistence itself lives outside this crate; the
//! in-memory implementation here backs tests and standalone deployments.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Store Trait
// ----------------------------------------------------------------------------

/// An entity with a stable lookup key.
pub trait Keyed {
    fn key(&self) -> String;
}

/// Minimal keyed-entity store interface.
pub trait Store<E>: Send + Sync {
    /// Look up an entity by key
    fn get(&self, key: &str) -> Option<E>;

    /// Add or replace an entity
    fn add(&self, entity: E);

    /// Snapshot of all entities
    fn stream(&self) -> Vec<E>;
}

// ----------------------------------------------------------------------------
// In-Memory Store
// ----------------------------------------------------------------------------

/// A [`Store`] backed by an in-process map.
#[derive(Default)]
pub struct MemoryStore<E> {
    entries: RwLock<BTreeMap<String, E>>,
}

impl<E> MemoryStore<E> {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryStore {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<E> Store<E> for MemoryStore<E>
where
    E: Keyed + Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<E> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn add(&self, entity: E) {
        self.entries
            .write()
            .unwrap()
            .insert(entity.key(), entity);
    }

    fn stream(&self) -> Vec<E> {
        self.entries.read().unwrap().values().cloned().collect()
    }
}

// ----------------------------------------------------------------------------
// Listener Configuration
// ----------------------------------------------------------------------------

/// One configured listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub enabled: bool,
}

impl Keyed for ListenerEntry {
    fn key(&self) -> String {
        self.id.clone()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.add(ListenerEntry {
            id: "default".into(),
            address: "0.0.0.0".into(),
            port: 9100,
            enabled: true,
        });

        let entry = store.get("default").unwrap();
        assert_eq!(entry.port, 9100);
        assert!(store.get("missing").is_none());
        assert_eq!(store.stream().len(), 1);
    }

    #[test]
    fn test_add_replaces_existing_key() {
        let store = MemoryStore::new();
        for port in [9100, 9101] {
            store.add(ListenerEntry {
                id: "default".into(),
                address: "0.0.0.0".into(),
                port,
                enabled: true,
            });
        }
        assert_eq!(store.stream().len(), 1);
        assert_eq!(store.get("default").unwrap().port, 9101);
    }
}
