//! Runtime configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use overmesh_core::ProtocolConfig;

// ----------------------------------------------------------------------------
// Runtime Configuration
// ----------------------------------------------------------------------------

/// Tunables for one [`NodeRuntime`](crate::runtime::NodeRuntime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Wire-level protocol settings
    pub protocol: ProtocolConfig,
    /// Outbound envelope queue depth per connection
    pub outbound_buffer: usize,
    /// Fan-out capacity of the store event channels
    pub event_capacity: usize,
    /// Deadline for a single TCP connect attempt
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            protocol: ProtocolConfig::default(),
            outbound_buffer: 256,
            event_capacity: 64,
            connect_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    /// The connect deadline as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Connection Loop Configuration
// ----------------------------------------------------------------------------

/// Settings for repeated connection attempts against a set of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Candidate addresses, tried in round-robin order
    pub targets: Vec<String>,
    /// Deadline for each individual attempt
    pub connect_timeout_ms: u64,
    /// Base pause between attempts
    pub cooldown_ms: u64,
    /// Double the cooldown every this many iterations; 0 keeps it constant
    pub cooldown_doubling_every: u32,
    /// Upper bound on the cooldown
    pub cooldown_limit_ms: u64,
    /// Give up after this many attempts; 0 retries forever
    pub iteration_limit: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            targets: Vec::new(),
            connect_timeout_ms: 5_000,
            cooldown_ms: 1_000,
            cooldown_doubling_every: 0,
            cooldown_limit_ms: 60_000,
            iteration_limit: 0,
        }
    }
}

impl LoopConfig {
    /// A single-target, single-attempt loop
    pub fn single(target: impl Into<String>) -> Self {
        LoopConfig {
            targets: vec![target.into()],
            iteration_limit: 1,
            ..LoopConfig::default()
        }
    }

    /// The per-attempt connect deadline as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The pause before the attempt following `iteration`
    pub fn cooldown_for(&self, iteration: u32) -> Duration {
        if self.cooldown_doubling_every == 0 {
            return Duration::from_millis(self.cooldown_ms);
        }
        let doublings = (iteration / self.cooldown_doubling_every).min(16);
        let cooldown = self.cooldown_ms.saturating_mul(1u64 << doublings);
        Duration::from_millis(cooldown.min(self.cooldown_limit_ms))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_cooldown() {
        let config = LoopConfig::default();
        assert_eq!(config.cooldown_for(0), Duration::from_millis(1_000));
        assert_eq!(config.cooldown_for(50), Duration::from_millis(1_000));
    }

    #[test]
    fn test_exponential_cooldown_caps_at_limit() {
        let config = LoopConfig {
            cooldown_ms: 1_000,
            cooldown_doubling_every: 2,
            cooldown_limit_ms: 5_000,
            ..LoopConfig::default()
        };

        assert_eq!(config.cooldown_for(0), Duration::from_millis(1_000));
        assert_eq!(config.cooldown_for(1), Duration::from_millis(1_000));
        assert_eq!(config.cooldown_for(2), Duration::from_millis(2_000));
        assert_eq!(config.cooldown_for(4), Duration::from_millis(4_000));
        assert_eq!(config.cooldown_for(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_single_target_loop() {
        let config = LoopConfig::single("10.0.0.1:9100");
        assert_eq!(config.targets, vec!["10.0.0.1:9100".to_string()]);
        assert_eq!(config.iteration_limit, 1);
    }
}
