//! Runtime construction

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use overmesh_core::{Cvid, InstanceRole};

use crate::config::RuntimeConfig;
use crate::exelet::{Exelet, ExeletStore};
use crate::network::NetworkStore;
use crate::runtime::{LocalIdentity, NodeRuntime, Shared};
use crate::store::ConnectionStore;

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for [`NodeRuntime`].
///
/// Servers self-assign their CVID here; agents and clients start without
/// one and adopt whatever each handshake assigns.
pub struct RuntimeBuilder {
    role: InstanceRole,
    uuid: Option<String>,
    config: RuntimeConfig,
    exelets: Vec<Exelet>,
}

impl RuntimeBuilder {
    pub(crate) fn new(role: InstanceRole) -> Self {
        RuntimeBuilder {
            role,
            uuid: None,
            config: RuntimeConfig::default(),
            exelets: Vec::new(),
        }
    }

    /// Use an explicit permanent UUID instead of generating one
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Replace the default configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an exelet at startup
    pub fn exelet(mut self, exelet: Exelet) -> Self {
        self.exelets.push(exelet);
        self
    }

    /// Assemble the runtime
    pub fn build(self) -> NodeRuntime {
        let uuid = self
            .uuid
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cvid = match self.role {
            InstanceRole::Server => Cvid::generate(InstanceRole::Server),
            _ => Cvid::NONE,
        };

        let exelets = Arc::new(ExeletStore::new());
        for exelet in self.exelets {
            exelets.register(exelet);
        }

        let connections = Arc::new(ConnectionStore::new(self.config.event_capacity));
        let network = Arc::new(NetworkStore::new(
            cvid,
            connections.clone(),
            self.config.event_capacity,
        ));

        info!(role = %self.role, %uuid, %cvid, "runtime assembled");
        NodeRuntime::from_shared(Arc::new(Shared {
            local: LocalIdentity::new(self.role, uuid, cvid),
            config: self.config,
            exelets,
            connections,
            network,
        }))
    }
}
