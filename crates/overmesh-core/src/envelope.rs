//! The wire-level message unit
//!
//! An [`Envelope`] carries one [`Payload`] between two nodes, together with
//! the source and destination identifiers and a correlation ID that ties
//! responses back to outstanding requests.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::cvid::Cvid;
use crate::payload::Payload;

// ----------------------------------------------------------------------------
// Correlation IDs
// ----------------------------------------------------------------------------

static NEXT_CORRELATION: AtomicU32 = AtomicU32::new(1);

/// Produce a correlation ID that is unique among this process's outstanding
/// requests. 0 is never returned; it marks envelopes that expect no reply.
pub fn next_correlation_id() -> u32 {
    loop {
        let id = NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// One framed protocol message. Immutable once sent.
///
/// A destination of [`Cvid::NONE`] means "deliver to the nearest hub".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session identifier of the sending node
    pub from: Cvid,
    /// Session identifier of the destination node, or the hub sentinel
    pub to: Cvid,
    /// Request/response correlation ID; 0 when no reply is expected
    pub correlation: u32,
    /// The typed message body
    pub payload: Payload,
}

impl Envelope {
    /// Build a one-way envelope that expects no reply
    pub fn new(from: Cvid, to: Cvid, payload: impl Into<Payload>) -> Self {
        Envelope {
            from,
            to,
            correlation: 0,
            payload: payload.into(),
        }
    }

    /// Build a request envelope with a fresh correlation ID
    pub fn request(from: Cvid, to: Cvid, payload: impl Into<Payload>) -> Self {
        Envelope {
            from,
            to,
            correlation: next_correlation_id(),
            payload: payload.into(),
        }
    }

    /// Build the response to this envelope, preserving its correlation ID.
    ///
    /// `from` is the responder's own identifier; the original source becomes
    /// the destination.
    pub fn reply(&self, from: Cvid, payload: impl Into<Payload>) -> Self {
        Envelope {
            from,
            to: self.from,
            correlation: self.correlation,
            payload: payload.into(),
        }
    }

    /// Whether the sender expects a reply
    pub fn expects_reply(&self) -> bool {
        self.correlation != 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvid::InstanceRole;
    use crate::payload::{Ping, Pong};

    #[test]
    fn test_request_assigns_unique_correlation() {
        let a = Cvid::generate(InstanceRole::Agent);
        let b = Cvid::generate(InstanceRole::Server);

        let first = Envelope::request(a, b, Ping);
        let second = Envelope::request(a, b, Ping);

        assert!(first.expects_reply());
        assert!(second.expects_reply());
        assert_ne!(first.correlation, second.correlation);
    }

    #[test]
    fn test_reply_preserves_correlation_and_swaps_direction() {
        let a = Cvid::generate(InstanceRole::Agent);
        let b = Cvid::generate(InstanceRole::Server);

        let request = Envelope::request(a, b, Ping);
        let response = request.reply(b, Pong);

        assert_eq!(response.correlation, request.correlation);
        assert_eq!(response.from, b);
        assert_eq!(response.to, a);
    }

    #[test]
    fn test_one_way_envelope_expects_no_reply() {
        let a = Cvid::generate(InstanceRole::Client);
        let envelope = Envelope::new(a, Cvid::NONE, Ping);
        assert!(!envelope.expects_reply());
        assert!(envelope.to.is_none());
    }
}
