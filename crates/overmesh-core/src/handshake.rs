//! Identity handshake state machine
//!
//! Immediately after a transport becomes active, the two endpoints negotiate
//! session identities: the requester announces its role and permanent UUID,
//! and the responder assigns it a fresh CVID while revealing its own. The
//! machine is pure (no I/O); the connection task feeds it envelopes and
//! transmits whatever it emits.
//!
//! Transitions consume `self`, so a resolved machine cannot be driven
//! further; the first resolution is the only one.

use serde::{Deserialize, Serialize};

use crate::cvid::{Cvid, InstanceRole};
use crate::envelope::Envelope;
use crate::errors::HandshakeError;
use crate::payload::{IdentityAnnouncement, IdentityAssigned, Payload};

// ----------------------------------------------------------------------------
// Session Identity
// ----------------------------------------------------------------------------

/// The result of a successful handshake, as seen from one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// This side's session identifier
    pub local_cvid: Cvid,
    /// The peer's session identifier
    pub peer_cvid: Cvid,
    /// The peer's permanent UUID
    pub peer_uuid: String,
    /// The peer's instance role
    pub peer_role: InstanceRole,
}

// ----------------------------------------------------------------------------
// Handshake States
// ----------------------------------------------------------------------------

/// Handshake state machine for either side of a new transport.
#[derive(Debug)]
pub enum Handshake {
    /// Requester side: announcement sent, waiting for the assignment
    AwaitingPeerResponse { role: InstanceRole, uuid: String },
    /// Responder side: waiting for the peer's announcement
    AwaitingRequest {
        responder_id: Cvid,
        responder_uuid: String,
    },
    /// Terminal: identities negotiated
    Established(SessionIdentity),
    /// Terminal: protocol-flow error; the transport should be closed
    Failed(HandshakeError),
}

impl Handshake {
    /// Start the requester side. Returns the machine together with the
    /// identity announcement to transmit on transport-active.
    pub fn requester(role: InstanceRole, uuid: impl Into<String>) -> (Self, Envelope) {
        let uuid = uuid.into();
        let announcement = Envelope::request(
            Cvid::NONE,
            Cvid::NONE,
            IdentityAnnouncement {
                role,
                uuid: uuid.clone(),
            },
        );
        (Handshake::AwaitingPeerResponse { role, uuid }, announcement)
    }

    /// Start the responder side with this node's own identity.
    pub fn responder(responder_id: Cvid, responder_uuid: impl Into<String>) -> Self {
        Handshake::AwaitingRequest {
            responder_id,
            responder_uuid: responder_uuid.into(),
        }
    }

    /// Feed one inbound envelope. Returns the successor state and an
    /// envelope to transmit, if any. Terminal states absorb further input
    /// unchanged.
    pub fn receive(self, envelope: &Envelope) -> (Self, Option<Envelope>) {
        match self {
            Handshake::AwaitingPeerResponse { role, uuid } => {
                Self::receive_assignment(role, uuid, envelope)
            }
            Handshake::AwaitingRequest {
                responder_id,
                responder_uuid,
            } => Self::receive_announcement(responder_id, responder_uuid, envelope),
            terminal => (terminal, None),
        }
    }

    fn receive_assignment(
        role: InstanceRole,
        _uuid: String,
        envelope: &Envelope,
    ) -> (Self, Option<Envelope>) {
        let assignment = match &envelope.payload {
            Payload::IdentityAssigned(assignment) => assignment,
            other => {
                return (
                    Handshake::Failed(HandshakeError::UnexpectedMessage {
                        state: "awaiting the identity assignment",
                        kind: other.kind(),
                    }),
                    None,
                );
            }
        };

        if assignment.assigned_id.is_none() {
            return (Handshake::Failed(HandshakeError::InvalidAssignedId), None);
        }
        if assignment.assigned_id.role() != Some(role) {
            return (
                Handshake::Failed(HandshakeError::RoleMismatch {
                    assigned: assignment.assigned_id,
                }),
                None,
            );
        }
        if assignment.responder_id.role() != Some(InstanceRole::Server) {
            return (
                Handshake::Failed(HandshakeError::IneligibleResponder {
                    responder: assignment.responder_id,
                }),
                None,
            );
        }
        if assignment.responder_uuid.is_empty() {
            return (Handshake::Failed(HandshakeError::EmptyUuid), None);
        }

        (
            Handshake::Established(SessionIdentity {
                local_cvid: assignment.assigned_id,
                peer_cvid: assignment.responder_id,
                peer_uuid: assignment.responder_uuid.clone(),
                peer_role: InstanceRole::Server,
            }),
            None,
        )
    }

    fn receive_announcement(
        responder_id: Cvid,
        responder_uuid: String,
        envelope: &Envelope,
    ) -> (Self, Option<Envelope>) {
        let announcement = match &envelope.payload {
            Payload::IdentityAnnouncement(announcement) => announcement,
            other => {
                return (
                    Handshake::Failed(HandshakeError::UnexpectedMessage {
                        state: "awaiting the identity announcement",
                        kind: other.kind(),
                    }),
                    None,
                );
            }
        };

        if announcement.uuid.is_empty() {
            return (Handshake::Failed(HandshakeError::EmptyUuid), None);
        }

        let assigned = Cvid::generate(announcement.role);
        let reply = envelope.reply(
            responder_id,
            IdentityAssigned {
                assigned_id: assigned,
                responder_id,
                responder_uuid,
            },
        );

        (
            Handshake::Established(SessionIdentity {
                local_cvid: responder_id,
                peer_cvid: assigned,
                peer_uuid: announcement.uuid.clone(),
                peer_role: announcement.role,
            }),
            Some(reply),
        )
    }

    /// Whether the machine reached a terminal state
    pub fn is_resolved(&self) -> bool {
        matches!(self, Handshake::Established(_) | Handshake::Failed(_))
    }

    /// Extract the terminal outcome, if resolved
    pub fn outcome(&self) -> Option<Result<&SessionIdentity, &HandshakeError>> {
        match self {
            Handshake::Established(identity) => Some(Ok(identity)),
            Handshake::Failed(error) => Some(Err(error)),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Ping;

    fn server_identity() -> (Cvid, String) {
        (Cvid::generate(InstanceRole::Server), "server-uuid".into())
    }

    #[test]
    fn test_successful_exchange_is_symmetric() {
        let (server_cvid, server_uuid) = server_identity();

        let (requester, announcement) = Handshake::requester(InstanceRole::Agent, "agent-uuid");
        let responder = Handshake::responder(server_cvid, server_uuid.clone());

        let (responder, reply) = responder.receive(&announcement);
        let reply = reply.expect("responder must emit the assignment");
        let (requester, extra) = requester.receive(&reply);
        assert!(extra.is_none());

        let requester_view = match requester.outcome() {
            Some(Ok(identity)) => identity.clone(),
            other => panic!("requester not established: {:?}", other),
        };
        let responder_view = match responder.outcome() {
            Some(Ok(identity)) => identity.clone(),
            other => panic!("responder not established: {:?}", other),
        };

        assert_eq!(requester_view.local_cvid, responder_view.peer_cvid);
        assert_eq!(requester_view.peer_cvid, responder_view.local_cvid);
        assert_eq!(requester_view.peer_uuid, "server-uuid");
        assert_eq!(responder_view.peer_uuid, "agent-uuid");
        assert_eq!(requester_view.local_cvid.role(), Some(InstanceRole::Agent));
        assert_eq!(requester_view.peer_role, InstanceRole::Server);
        assert_eq!(responder_view.peer_role, InstanceRole::Agent);
    }

    #[test]
    fn test_requester_rejects_wrong_message_kind() {
        let (requester, _announcement) = Handshake::requester(InstanceRole::Client, "client-uuid");
        let bogus = Envelope::new(Cvid::NONE, Cvid::NONE, Ping);

        let (requester, reply) = requester.receive(&bogus);
        assert!(reply.is_none());
        assert!(matches!(
            requester,
            Handshake::Failed(HandshakeError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_responder_rejects_empty_uuid() {
        let (server_cvid, server_uuid) = server_identity();
        let responder = Handshake::responder(server_cvid, server_uuid);

        let announcement = Envelope::request(
            Cvid::NONE,
            Cvid::NONE,
            IdentityAnnouncement {
                role: InstanceRole::Agent,
                uuid: String::new(),
            },
        );

        let (responder, reply) = responder.receive(&announcement);
        assert!(reply.is_none());
        assert!(matches!(
            responder,
            Handshake::Failed(HandshakeError::EmptyUuid)
        ));
    }

    #[test]
    fn test_requester_rejects_non_server_responder() {
        let (requester, _announcement) = Handshake::requester(InstanceRole::Agent, "agent-uuid");

        let assignment = Envelope::new(
            Cvid::NONE,
            Cvid::NONE,
            IdentityAssigned {
                assigned_id: Cvid::generate(InstanceRole::Agent),
                responder_id: Cvid::generate(InstanceRole::Client),
                responder_uuid: "not-a-server".into(),
            },
        );

        let (requester, _) = requester.receive(&assignment);
        assert!(matches!(
            requester,
            Handshake::Failed(HandshakeError::IneligibleResponder { .. })
        ));
    }

    #[test]
    fn test_requester_rejects_role_mismatch() {
        let (requester, _announcement) = Handshake::requester(InstanceRole::Agent, "agent-uuid");

        let assignment = Envelope::new(
            Cvid::NONE,
            Cvid::NONE,
            IdentityAssigned {
                assigned_id: Cvid::generate(InstanceRole::Client),
                responder_id: Cvid::generate(InstanceRole::Server),
                responder_uuid: "server-uuid".into(),
            },
        );

        let (requester, _) = requester.receive(&assignment);
        assert!(matches!(
            requester,
            Handshake::Failed(HandshakeError::RoleMismatch { .. })
        ));
    }

    #[test]
    fn test_terminal_state_absorbs_input() {
        let (server_cvid, server_uuid) = server_identity();
        let responder = Handshake::responder(server_cvid, server_uuid);

        let (announcement_machine, announcement) =
            Handshake::requester(InstanceRole::Agent, "agent-uuid");
        drop(announcement_machine);

        let (responder, _) = responder.receive(&announcement);
        assert!(responder.is_resolved());

        // A second announcement must not re-resolve or emit anything.
        let before = match responder.outcome() {
            Some(Ok(identity)) => identity.clone(),
            _ => panic!("responder should be established"),
        };
        let (responder, reply) = responder.receive(&announcement);
        assert!(reply.is_none());
        match responder.outcome() {
            Some(Ok(identity)) => assert_eq!(*identity, before),
            _ => panic!("terminal state changed"),
        }
    }
}
