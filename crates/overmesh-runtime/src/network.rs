//! Logical network overlay
//!
//! The [`NetworkStore`] maintains an undirected multigraph of the instances
//! visible from this node: vertices are CVIDs, edges are live connections
//! (parallel edges are allowed, distinguished by connection ID). Delivery
//! decisions route either directly to an adjacent node or through the
//! preferred server hub.
//!
//! The graph is mutated only under one coarse lock; it is low-contention
//! relative to message volume.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use overmesh_core::envelope::Envelope;
use overmesh_core::future::MessageFuture;
use overmesh_core::{Cvid, InstanceRole, RoutingError};

use crate::store::ConnectionStore;

// ----------------------------------------------------------------------------
// Network Events
// ----------------------------------------------------------------------------

/// Overlay-level events derived from connection lifecycle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A server instance became reachable
    ServerEstablished(Cvid),
    /// The last reachable server instance was lost
    ServerLost(Cvid),
}

// ----------------------------------------------------------------------------
// Topology
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    a: Cvid,
    b: Cvid,
    connection: u64,
}

struct Topology {
    local: Cvid,
    /// BTreeSet keeps node iteration in ascending CVID order, which makes
    /// hub re-selection deterministic.
    nodes: BTreeSet<Cvid>,
    edges: Vec<Edge>,
    preferred_hub: Option<Cvid>,
}

impl Topology {
    fn degree(&self, cvid: Cvid) -> usize {
        self.edges
            .iter()
            .filter(|edge| edge.a == cvid || edge.b == cvid)
            .count()
    }

    fn adjacent_to_local(&self, cvid: Cvid) -> bool {
        self.edges.iter().any(|edge| {
            (edge.a == self.local && edge.b == cvid) || (edge.b == self.local && edge.a == cvid)
        })
    }

    fn first_server(&self) -> Option<Cvid> {
        self.nodes
            .iter()
            .copied()
            .find(|node| *node != self.local && node.role() == Some(InstanceRole::Server))
    }
}

// ----------------------------------------------------------------------------
// Network Store
// ----------------------------------------------------------------------------

/// The logical overlay graph and its routing operations.
pub struct NetworkStore {
    topology: Mutex<Topology>,
    events: broadcast::Sender<NetworkEvent>,
    connections: Arc<ConnectionStore>,
}

impl NetworkStore {
    /// Create an overlay containing only the local node
    pub fn new(local: Cvid, connections: Arc<ConnectionStore>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        let mut nodes = BTreeSet::new();
        nodes.insert(local);
        NetworkStore {
            topology: Mutex::new(Topology {
                local,
                nodes,
                edges: Vec::new(),
                preferred_hub: None,
            }),
            events,
            connections,
        }
    }

    /// The local node's identifier
    pub fn local(&self) -> Cvid {
        self.topology.lock().unwrap().local
    }

    /// Replace the local node after a session re-assignment, carrying its
    /// incident edges over to the new identifier
    pub fn set_local(&self, cvid: Cvid) {
        let mut topology = self.topology.lock().unwrap();
        let old = topology.local;
        if old == cvid {
            return;
        }
        topology.nodes.remove(&old);
        topology.nodes.insert(cvid);
        topology.local = cvid;
        for edge in &mut topology.edges {
            if edge.a == old {
                edge.a = cvid;
            }
            if edge.b == old {
                edge.b = cvid;
            }
        }
    }

    /// Subscribe to overlay events
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Graph mutation
    // ------------------------------------------------------------------

    /// React to an established connection: add the node and the edge from
    /// the local node; announce newly reachable servers.
    pub fn on_established(&self, cvid: Cvid, connection_id: u64) {
        {
            let mut topology = self.topology.lock().unwrap();
            let local = topology.local;
            topology.nodes.insert(cvid);
            topology.edges.push(Edge {
                a: local,
                b: cvid,
                connection: connection_id,
            });
        }
        if cvid.role() == Some(InstanceRole::Server) {
            let _ = self.events.send(NetworkEvent::ServerEstablished(cvid));
        }
    }

    /// React to a lost connection: remove its edge, prune nodes left with
    /// no edges, and announce when the last server went away.
    pub fn on_lost(&self, cvid: Cvid, connection_id: u64) {
        let server_lost = {
            let mut topology = self.topology.lock().unwrap();
            topology.edges.retain(|edge| edge.connection != connection_id);

            let local = topology.local;
            let orphaned: Vec<Cvid> = topology
                .nodes
                .iter()
                .copied()
                .filter(|node| *node != local && topology.degree(*node) == 0)
                .collect();
            for node in orphaned {
                topology.nodes.remove(&node);
            }

            cvid.role() == Some(InstanceRole::Server) && topology.first_server().is_none()
        };
        if server_lost {
            let _ = self.events.send(NetworkEvent::ServerLost(cvid));
        }
    }

    // ------------------------------------------------------------------
    // Graph queries
    // ------------------------------------------------------------------

    /// All nodes currently in the overlay, ascending
    pub fn nodes(&self) -> Vec<Cvid> {
        self.topology.lock().unwrap().nodes.iter().copied().collect()
    }

    /// Number of edges incident to a node
    pub fn degree(&self, cvid: Cvid) -> usize {
        self.topology.lock().unwrap().degree(cvid)
    }

    /// Whether a node shares an edge with the local node
    pub fn is_adjacent(&self, cvid: Cvid) -> bool {
        self.topology.lock().unwrap().adjacent_to_local(cvid)
    }

    // ------------------------------------------------------------------
    // Hub selection
    // ------------------------------------------------------------------

    /// Explicitly set the preferred hub
    pub fn set_preferred_hub(&self, cvid: Cvid) {
        self.topology.lock().unwrap().preferred_hub = Some(cvid);
    }

    /// The current preferred hub. When the stored hub is no longer in the
    /// graph, the first server-role node in ascending CVID order becomes
    /// the new hub before any dependent delivery proceeds.
    pub fn preferred_hub(&self) -> Result<Cvid, RoutingError> {
        let mut topology = self.topology.lock().unwrap();
        if let Some(hub) = topology.preferred_hub {
            if topology.nodes.contains(&hub) {
                return Ok(hub);
            }
            debug!(%hub, "preferred hub left the overlay; re-selecting");
        }
        match topology.first_server() {
            Some(hub) => {
                topology.preferred_hub = Some(hub);
                Ok(hub)
            }
            None => Err(RoutingError::NoHub),
        }
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Transmit through the preferred hub. Returns the next hop.
    pub fn deliver(&self, envelope: Envelope) -> Result<Cvid, RoutingError> {
        let hub = self.preferred_hub()?;
        let connection = self
            .connections
            .get(hub)
            .ok_or(RoutingError::UnknownPeer(hub))?;
        connection.send(envelope);
        Ok(hub)
    }

    /// Transmit along the most direct path: straight to an adjacent
    /// destination, otherwise through the preferred hub. Returns the next
    /// hop.
    pub fn route(&self, envelope: Envelope) -> Result<Cvid, RoutingError> {
        let destination = envelope.to;
        if !destination.is_none() && self.is_adjacent(destination) {
            if let Some(connection) = self.connections.get(destination) {
                connection.send(envelope);
                return Ok(destination);
            }
        }
        self.deliver(envelope)
    }

    /// Transmit along the most direct path and await a response.
    ///
    /// The response future is registered on the next-hop connection before
    /// the envelope is transmitted, so a reply cannot arrive before its
    /// waiter exists.
    pub fn route_expecting_reply(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<MessageFuture, RoutingError> {
        let destination = envelope.to;
        let next_hop = if !destination.is_none() && self.is_adjacent(destination) {
            destination
        } else {
            self.preferred_hub()?
        };

        let connection = self
            .connections
            .get(next_hop)
            .ok_or(RoutingError::UnknownPeer(next_hop))?;
        let future = connection.read(envelope.correlation, Some(timeout));
        connection.send(envelope);
        Ok(future)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_local(local: Cvid) -> NetworkStore {
        NetworkStore::new(local, Arc::new(ConnectionStore::new(16)), 16)
    }

    #[test]
    fn test_established_adds_node_and_edge() {
        let local = Cvid::generate(InstanceRole::Agent);
        let store = store_with_local(local);
        let server = Cvid::generate(InstanceRole::Server);

        store.on_established(server, 1);

        assert!(store.is_adjacent(server));
        assert_eq!(store.degree(server), 1);
        assert_eq!(store.nodes().len(), 2);
    }

    #[test]
    fn test_lost_prunes_disconnected_nodes_but_never_local() {
        let local = Cvid::generate(InstanceRole::Agent);
        let store = store_with_local(local);
        let server = Cvid::generate(InstanceRole::Server);

        store.on_established(server, 1);
        store.on_lost(server, 1);

        assert_eq!(store.nodes(), vec![local]);
        assert_eq!(store.degree(local), 0);
    }

    #[test]
    fn test_parallel_edges_survive_single_loss() {
        let local = Cvid::generate(InstanceRole::Client);
        let store = store_with_local(local);
        let server = Cvid::generate(InstanceRole::Server);

        store.on_established(server, 1);
        store.on_established(server, 2);
        store.on_lost(server, 1);

        assert!(store.is_adjacent(server));
        assert_eq!(store.degree(server), 1);

        store.on_lost(server, 2);
        assert!(!store.is_adjacent(server));
        assert_eq!(store.nodes(), vec![local]);
    }

    #[test]
    fn test_degree_invariant_over_random_event_sequences() {
        let local = Cvid::generate(InstanceRole::Server);
        let store = store_with_local(local);

        let peers: Vec<Cvid> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    Cvid::generate(InstanceRole::Agent)
                } else {
                    Cvid::generate(InstanceRole::Client)
                }
            })
            .collect();

        for (index, peer) in peers.iter().enumerate() {
            store.on_established(*peer, index as u64);
        }
        for (index, peer) in peers.iter().enumerate().take(5) {
            store.on_lost(*peer, index as u64);
        }

        for node in store.nodes() {
            if node != local {
                assert!(store.degree(node) >= 1, "non-local node with degree 0");
            }
        }
        assert!(store.nodes().contains(&local));
    }

    #[test]
    fn test_hub_reselection_is_deterministic() {
        let local = Cvid::generate(InstanceRole::Agent);
        let store = store_with_local(local);

        let servers: Vec<Cvid> = (0..3).map(|_| Cvid::generate(InstanceRole::Server)).collect();
        for (index, server) in servers.iter().enumerate() {
            store.on_established(*server, index as u64);
        }

        let mut sorted = servers.clone();
        sorted.sort();
        assert_eq!(store.preferred_hub().unwrap(), sorted[0]);

        // Losing the hub re-selects the next lowest server.
        let lost_id = servers.iter().position(|s| *s == sorted[0]).unwrap() as u64;
        store.on_lost(sorted[0], lost_id);
        assert_eq!(store.preferred_hub().unwrap(), sorted[1]);
    }

    #[test]
    fn test_no_hub_is_an_error() {
        let local = Cvid::generate(InstanceRole::Agent);
        let store = store_with_local(local);
        let client = Cvid::generate(InstanceRole::Client);
        store.on_established(client, 1);

        assert_eq!(store.preferred_hub(), Err(RoutingError::NoHub));

        let envelope = Envelope::new(local, client, overmesh_core::payload::Ping);
        // No connection registered either way; the routing error must
        // surface, not hang or panic.
        assert!(store.deliver(envelope).is_err());
    }

    #[test]
    fn test_server_lost_event_fires_on_last_server() {
        let local = Cvid::generate(InstanceRole::Client);
        let store = store_with_local(local);
        let mut events = store.subscribe();

        let first = Cvid::generate(InstanceRole::Server);
        let second = Cvid::generate(InstanceRole::Server);
        store.on_established(first, 1);
        store.on_established(second, 2);

        assert_eq!(
            events.try_recv().unwrap(),
            NetworkEvent::ServerEstablished(first)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            NetworkEvent::ServerEstablished(second)
        );

        store.on_lost(first, 1);
        assert!(events.try_recv().is_err(), "a server remains; no event yet");

        store.on_lost(second, 2);
        assert_eq!(events.try_recv().unwrap(), NetworkEvent::ServerLost(second));
    }

    #[test]
    fn test_set_local_carries_edges() {
        let initial = Cvid::NONE;
        let store = store_with_local(initial);
        let server = Cvid::generate(InstanceRole::Server);
        store.on_established(server, 1);

        let assigned = Cvid::generate(InstanceRole::Agent);
        store.set_local(assigned);

        assert_eq!(store.local(), assigned);
        assert!(store.is_adjacent(server));
        assert!(!store.nodes().contains(&initial));
    }

    #[test]
    fn test_route_prefers_direct_path_marker() {
        // Routing with live connections is covered by the integration
        // suite; here only the no-connection fallback path is exercised.
        let local = Cvid::generate(InstanceRole::Agent);
        let store = store_with_local(local);
        let peer = Cvid::generate(InstanceRole::Agent);
        store.on_established(peer, 1);

        let envelope = Envelope::new(local, peer, overmesh_core::payload::Ping);
        // Adjacent but no registered connection: falls through to deliver,
        // which fails for lack of a hub.
        assert_eq!(store.route(envelope), Err(RoutingError::NoHub));
    }
}
