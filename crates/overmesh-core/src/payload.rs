//! Message payloads
//!
//! Every message kind on the wire is a dedicated struct, collected into the
//! [`Payload`] tagged union. [`PayloadKind`] is the fieldless discriminant
//! used as the dispatch key in handler tables.

use serde::{Deserialize, Serialize};

use crate::cvid::{Cvid, InstanceRole};

// ----------------------------------------------------------------------------
// Handshake Messages
// ----------------------------------------------------------------------------

/// Opening handshake message: the requester announces its role and permanent
/// identity immediately after the transport becomes active.
///
/// Exempt from authentication gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAnnouncement {
    /// The requester's instance role
    pub role: InstanceRole,
    /// The requester's permanent UUID (survives reconnects)
    pub uuid: String,
}

/// Closing handshake message: the responder assigns the requester a fresh
/// session identifier and announces its own identity.
///
/// Exempt from authentication gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAssigned {
    /// The session identifier assigned to the requester
    pub assigned_id: Cvid,
    /// The responder's own session identifier
    pub responder_id: Cvid,
    /// The responder's permanent UUID
    pub responder_uuid: String,
}

// ----------------------------------------------------------------------------
// Core Messages
// ----------------------------------------------------------------------------

/// Liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping;

/// Liveness probe response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pong;

/// Diagnostic request that asks the peer to return the carried data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub data: String,
}

/// Response to an [`Echo`] request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoReply {
    pub data: String,
}

/// Generic command result, used as the failure reply when a handler cannot
/// produce its normal response type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub message: Option<String>,
}

impl Outcome {
    /// A successful outcome with no message
    pub fn success() -> Self {
        Outcome {
            success: true,
            message: None,
        }
    }

    /// A failed outcome carrying a reason
    pub fn failure(message: impl Into<String>) -> Self {
        Outcome {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A plugin-namespaced message: an opaque body tagged with the namespace of
/// the handler set that understands it and a name within that namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub namespace: String,
    pub name: String,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Payload Union
// ----------------------------------------------------------------------------

/// The tagged union over all defined message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    IdentityAnnouncement(IdentityAnnouncement),
    IdentityAssigned(IdentityAssigned),
    Ping(Ping),
    Pong(Pong),
    Echo(Echo),
    EchoReply(EchoReply),
    Outcome(Outcome),
    Extension(Extension),
}

impl Payload {
    /// The dispatch key for this payload
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::IdentityAnnouncement(_) => PayloadKind::IdentityAnnouncement,
            Payload::IdentityAssigned(_) => PayloadKind::IdentityAssigned,
            Payload::Ping(_) => PayloadKind::Ping,
            Payload::Pong(_) => PayloadKind::Pong,
            Payload::Echo(_) => PayloadKind::Echo,
            Payload::EchoReply(_) => PayloadKind::EchoReply,
            Payload::Outcome(_) => PayloadKind::Outcome,
            Payload::Extension(_) => PayloadKind::Extension,
        }
    }
}

/// Fieldless discriminant of [`Payload`], used as the handler-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    IdentityAnnouncement,
    IdentityAssigned,
    Ping,
    Pong,
    Echo,
    EchoReply,
    Outcome,
    Extension,
}

// ----------------------------------------------------------------------------
// Conversions
// ----------------------------------------------------------------------------

macro_rules! payload_message {
    ($variant:ident, $message:ty) => {
        impl From<$message> for Payload {
            fn from(message: $message) -> Payload {
                Payload::$variant(message)
            }
        }

        impl TryFrom<Payload> for $message {
            type Error = Payload;

            fn try_from(payload: Payload) -> Result<$message, Payload> {
                match payload {
                    Payload::$variant(message) => Ok(message),
                    other => Err(other),
                }
            }
        }
    };
}

payload_message!(IdentityAnnouncement, IdentityAnnouncement);
payload_message!(IdentityAssigned, IdentityAssigned);
payload_message!(Ping, Ping);
payload_message!(Pong, Pong);
payload_message!(Echo, Echo);
payload_message!(EchoReply, EchoReply);
payload_message!(Outcome, Outcome);
payload_message!(Extension, Extension);

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let payload: Payload = Ping.into();
        assert_eq!(payload.kind(), PayloadKind::Ping);

        let payload: Payload = Outcome::failure("nope").into();
        assert_eq!(payload.kind(), PayloadKind::Outcome);
    }

    #[test]
    fn test_typed_extraction() {
        let payload: Payload = EchoReply {
            data: "hello".into(),
        }
        .into();

        let reply = EchoReply::try_from(payload).unwrap();
        assert_eq!(reply.data, "hello");
    }

    #[test]
    fn test_extraction_returns_original_on_mismatch() {
        let payload: Payload = Pong.into();
        let err = Echo::try_from(payload).unwrap_err();
        assert_eq!(err.kind(), PayloadKind::Pong);
    }

    #[test]
    fn test_serde_roundtrip() {
        let payload: Payload = Extension {
            namespace: "com.example.shell".into(),
            name: "rq_execute".into(),
            data: vec![1, 2, 3],
        }
        .into();

        let bytes = bincode::serialize(&payload).unwrap();
        let decoded: Payload = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }
}
