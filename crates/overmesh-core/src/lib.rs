//! Overmesh Core Protocol Implementation
//!
//! This crate provides the foundational types, wire codec, handshake state
//! machine, and correlation futures for the Overmesh session protocol. It
//! contains no I/O; `overmesh-runtime` drives these pieces over real
//! transports.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod cvid;
pub mod envelope;
pub mod errors;
pub mod future;
pub mod handshake;
pub mod payload;
pub mod wire;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::ProtocolConfig;
pub use cvid::{Cvid, InstanceRole};
pub use envelope::Envelope;
pub use errors::{
    HandshakeError, OvermeshError, RequestError, Result, RoutingError, TransportError, WireError,
};
pub use future::{CommandFuture, FutureCell, HandshakeFuture, MessageFuture, ResponseFuture};
pub use handshake::{Handshake, SessionIdentity};
pub use payload::{Payload, PayloadKind};
