//! Overmesh Runtime Engine
//!
//! This crate contains the runtime engine for the Overmesh protocol:
//! - `Connection`: one transport driven by one task, with request/response
//!   correlation and auth-gated dispatch
//! - The exelet registry and dispatcher
//! - `ConnectionStore` / `NetworkStore`: live connections and the logical
//!   overlay graph with hub-based routing
//! - `NodeRuntime`: per-instance assembly of the above (no global state)
//!
//! `overmesh-core` provides the protocol definitions; this is the engine
//! that drives them over real transports.

pub mod builder;
pub mod config;
pub mod connection;
pub mod data;
pub mod exelet;
pub mod network;
pub mod plugin;
pub mod runtime;
pub mod store;
pub mod transport;

pub use builder::RuntimeBuilder;
pub use config::{LoopConfig, RuntimeConfig};
pub use connection::{Connection, HandshakeSide};
pub use data::{Keyed, ListenerEntry, MemoryStore, Store};
pub use exelet::{
    core_exelet, AuthRequirement, DispatchMap, ExecutionMode, Exelet, ExeletBuilder,
    ExeletContext, ExeletStore, HandlerFn, HandlerKey, HandlerSpec, ALL_ROLES,
};
pub use network::{NetworkEvent, NetworkStore};
pub use plugin::PluginEvent;
pub use runtime::NodeRuntime;
pub use store::{ConnectionEvent, ConnectionStore};
pub use transport::{duplex_pair, DuplexTransport, TcpTransport, Transport};

// Re-export core types for convenience
pub use overmesh_core::{
    Cvid, Envelope, HandshakeError, InstanceRole, OvermeshError, Payload, PayloadKind,
    ProtocolConfig, RequestError, Result, RoutingError, SessionIdentity, TransportError,
};
