//! Error types for the Overmesh protocol
//!
//! Each protocol concern has its own error enum; [`OvermeshError`] unifies
//! them for APIs that cross concern boundaries. Errors that are stored in
//! futures and handed to multiple listeners ([`HandshakeError`],
//! [`RequestError`]) are `Clone` by construction.

use std::time::Duration;

use crate::cvid::Cvid;
use crate::payload::PayloadKind;

// ----------------------------------------------------------------------------
// Wire Errors
// ----------------------------------------------------------------------------

/// Framing and codec errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame length {length} exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("frame length prefix does not fit in 32 bits")]
    LengthOverflow,

    /// The frame body could not be decoded. The frame boundary was still
    /// consumed, so the stream remains usable.
    #[error("undecodable frame body: {0}")]
    Body(#[source] bincode::Error),

    #[error("envelope serialization failed: {0}")]
    Encode(#[source] bincode::Error),
}

impl WireError {
    /// Whether the stream is still frame-aligned after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WireError::Body(_))
    }
}

// ----------------------------------------------------------------------------
// Handshake Errors
// ----------------------------------------------------------------------------

/// Protocol-flow errors raised by the identity handshake. Non-fatal to the
/// owning process; only the affected connection is torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unexpected {kind:?} while {state}")]
    UnexpectedMessage {
        state: &'static str,
        kind: PayloadKind,
    },

    #[error("identity announcement carried an empty uuid")]
    EmptyUuid,

    #[error("assigned id {assigned} does not carry the announced role")]
    RoleMismatch { assigned: Cvid },

    #[error("assigned id is the reserved sentinel")]
    InvalidAssignedId,

    #[error("responder {responder} is not a server instance")]
    IneligibleResponder { responder: Cvid },

    #[error("handshake did not resolve within {0:?}")]
    TimedOut(Duration),

    #[error("connection closed before the handshake resolved")]
    Closed,
}

// ----------------------------------------------------------------------------
// Request Errors
// ----------------------------------------------------------------------------

/// Failure modes of an outstanding request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection closed with the request outstanding")]
    ConnectionClosed,

    #[error("request aborted")]
    Aborted,

    #[error("expected {expected}, received {actual:?}")]
    InvalidResponse {
        expected: &'static str,
        actual: PayloadKind,
    },

    #[error("peer reported failure: {0}")]
    Rejected(String),
}

// ----------------------------------------------------------------------------
// Routing Errors
// ----------------------------------------------------------------------------

/// Failures of overlay delivery decisions. Always surfaced to the caller,
/// never a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no server hub is reachable")]
    NoHub,

    #[error("no live connection to {0}")]
    UnknownPeer(Cvid),
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Faults of the raw byte channel beneath a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o fault: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("all connection attempts exhausted")]
    AttemptsExhausted,
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Top-level error for the Overmesh protocol stack.
#[derive(Debug, thiserror::Error)]
pub enum OvermeshError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("handler error: {message}")]
    Handler { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },
}

impl OvermeshError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        OvermeshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a handler error with a message
    pub fn handler_error<T: Into<String>>(message: T) -> Self {
        OvermeshError::Handler {
            message: message.into(),
        }
    }

    /// Create an invalid-state error with a message
    pub fn state_error<T: Into<String>>(message: T) -> Self {
        OvermeshError::InvalidState {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OvermeshError>;
