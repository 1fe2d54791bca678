//! Protocol-level configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::DEFAULT_MAX_FRAME_SIZE;

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Tunables shared by both sides of every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Upper bound on a single frame body in bytes
    pub max_frame_size: usize,
    /// Default deadline for request/response exchanges
    pub message_timeout_ms: u64,
    /// Deadline for the identity handshake after transport-active
    pub handshake_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            message_timeout_ms: 5_000,
            handshake_timeout_ms: 3_000,
        }
    }
}

impl ProtocolConfig {
    /// The request/response deadline as a [`Duration`]
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// The handshake deadline as a [`Duration`]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.message_timeout(), Duration::from_millis(5_000));
    }
}
