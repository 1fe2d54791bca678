//! Session-scoped node identifiers
//!
//! A CVID is a positive 32-bit ID that uniquely identifies an instance on an
//! overmesh network for the duration of one session. It is assigned by the
//! responding peer during the handshake and re-assigned on every reconnect.
//! For a long-term identity, use the instance UUID instead.

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Instance Roles
// ----------------------------------------------------------------------------

/// The category of a node on the network.
///
/// The discriminant doubles as the role tag embedded in the low bits of a
/// [`Cvid`]; 0 is reserved and never encodes a valid role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InstanceRole {
    /// A managed endpoint that executes commands
    Agent = 1,
    /// A coordination hub that relays traffic between other instances
    Server = 2,
    /// An interactive viewer that issues commands
    Client = 3,
}

impl InstanceRole {
    /// Decode a role from its wire tag
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(InstanceRole::Agent),
            2 => Some(InstanceRole::Server),
            3 => Some(InstanceRole::Client),
            _ => None,
        }
    }

    /// The wire tag for this role
    pub fn id(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRole::Agent => write!(f, "agent"),
            InstanceRole::Server => write!(f, "server"),
            InstanceRole::Client => write!(f, "client"),
        }
    }
}

// ----------------------------------------------------------------------------
// CVID
// ----------------------------------------------------------------------------

/// The number of low bits that encode the instance role.
pub const ROLE_BITS: u32 = 3;

/// A session-scoped node identifier.
///
/// Anatomy: the low [`ROLE_BITS`] bits carry the instance role tag and the
/// remaining high bits carry a random component. The sign bit is always
/// clear, so a CVID is a positive value in every signed representation.
///
/// `Cvid::NONE` (the zero value) is not a valid identifier; it appears in
/// envelope destination fields as the "nearest hub" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Cvid(u32);

impl Cvid {
    /// The absent/nearest-hub sentinel
    pub const NONE: Cvid = Cvid(0);

    /// Wrap a raw wire value
    pub const fn from_raw(value: u32) -> Self {
        Cvid(value)
    }

    /// The raw wire value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the absent/nearest-hub sentinel
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Generate a fresh CVID tagged with the given role
    pub fn generate(role: InstanceRole) -> Self {
        loop {
            let random: u32 = rand::random();
            let id = ((random << ROLE_BITS) | role.id()) & 0x7fff_ffff;
            if id != 0 {
                return Cvid(id);
            }
        }
    }

    /// Extract the role tag, if the low bits encode one
    pub fn role(self) -> Option<InstanceRole> {
        InstanceRole::from_id(self.0 & ((1 << ROLE_BITS) - 1))
    }
}

impl fmt::Display for Cvid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
