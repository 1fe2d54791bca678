//! Runtime assembly
//!
//! A [`NodeRuntime`] bundles one instance's identity, configuration, and
//! stores. Nothing here is a process-wide singleton: several runtimes can
//! coexist in one process, which the integration tests rely on.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use overmesh_core::{Cvid, InstanceRole, OvermeshError, TransportError};

use crate::builder::RuntimeBuilder;
use crate::config::{LoopConfig, RuntimeConfig};
use crate::connection::{Connection, HandshakeSide};
use crate::data::{ListenerEntry, Store};
use crate::exelet::ExeletStore;
use crate::network::NetworkStore;
use crate::plugin::PluginEvent;
use crate::store::ConnectionStore;
use crate::transport::{TcpTransport, Transport};

// ----------------------------------------------------------------------------
// Local Identity
// ----------------------------------------------------------------------------

/// This instance's own identity. The CVID changes on every handshake for
/// non-server roles; the UUID never does.
pub(crate) struct LocalIdentity {
    pub role: InstanceRole,
    pub uuid: String,
    cvid: AtomicU32,
}

impl LocalIdentity {
    pub(crate) fn new(role: InstanceRole, uuid: String, cvid: Cvid) -> Self {
        LocalIdentity {
            role,
            uuid,
            cvid: AtomicU32::new(cvid.raw()),
        }
    }

    pub(crate) fn cvid(&self) -> Cvid {
        Cvid::from_raw(self.cvid.load(Ordering::SeqCst))
    }

    pub(crate) fn set_cvid(&self, cvid: Cvid) {
        self.cvid.store(cvid.raw(), Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Shared Context
// ----------------------------------------------------------------------------

/// The dependency bundle handed to every connection task.
pub(crate) struct Shared {
    pub config: RuntimeConfig,
    pub local: LocalIdentity,
    pub exelets: Arc<ExeletStore>,
    pub connections: Arc<ConnectionStore>,
    pub network: Arc<NetworkStore>,
}

// ----------------------------------------------------------------------------
// Node Runtime
// ----------------------------------------------------------------------------

/// One running Overmesh instance.
pub struct NodeRuntime {
    shared: Arc<Shared>,
}

impl NodeRuntime {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        NodeRuntime { shared }
    }

    /// Start building a runtime for the given instance role
    pub fn builder(role: InstanceRole) -> RuntimeBuilder {
        RuntimeBuilder::new(role)
    }

    /// This instance's role
    pub fn role(&self) -> InstanceRole {
        self.shared.local.role
    }

    /// This instance's permanent UUID
    pub fn uuid(&self) -> &str {
        &self.shared.local.uuid
    }

    /// This instance's current session identifier
    pub fn local_cvid(&self) -> Cvid {
        self.shared.local.cvid()
    }

    /// The runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The exelet registrations
    pub fn exelets(&self) -> &Arc<ExeletStore> {
        &self.shared.exelets
    }

    /// The live connection registry
    pub fn connections(&self) -> &Arc<ConnectionStore> {
        &self.shared.connections
    }

    /// The overlay graph
    pub fn network(&self) -> &Arc<NetworkStore> {
        &self.shared.network
    }

    // ------------------------------------------------------------------
    // Connection establishment
    // ------------------------------------------------------------------

    /// Drive a pre-connected transport as one side of the handshake. Used
    /// by the accept loop, by tests with in-memory transports, and by TLS
    /// wrappers that finish their own negotiation first.
    pub fn attach_transport(
        &self,
        transport: Box<dyn Transport>,
        side: HandshakeSide,
    ) -> Arc<Connection> {
        Connection::spawn(transport, side, self.shared.clone())
    }

    /// Dial a peer and await the handshake
    pub async fn connect(&self, addr: &str) -> overmesh_core::Result<Arc<Connection>> {
        let transport =
            TcpTransport::connect(addr, self.shared.config.connect_timeout()).await?;
        let connection = self.attach_transport(Box::new(transport), HandshakeSide::Requester);
        connection
            .established()
            .wait()
            .await
            .map_err(OvermeshError::from)?;
        Ok(connection)
    }

    /// Repeatedly attempt the targets in `config` until a handshake
    /// succeeds or the iteration limit is reached
    pub async fn connect_loop(&self, config: &LoopConfig) -> overmesh_core::Result<Arc<Connection>> {
        if config.targets.is_empty() {
            return Err(OvermeshError::config_error("connection loop has no targets"));
        }

        let mut iteration: u32 = 0;
        loop {
            let target = &config.targets[iteration as usize % config.targets.len()];
            match TcpTransport::connect(target, config.connect_timeout()).await {
                Ok(transport) => {
                    let connection =
                        self.attach_transport(Box::new(transport), HandshakeSide::Requester);
                    match connection.established().wait().await {
                        Ok(_) => return Ok(connection),
                        Err(error) => debug!(%target, %error, "handshake failed"),
                    }
                }
                Err(error) => debug!(%target, %error, "connection attempt failed"),
            }

            iteration += 1;
            if config.iteration_limit != 0 && iteration >= config.iteration_limit {
                return Err(TransportError::AttemptsExhausted.into());
            }
            tokio::time::sleep(config.cooldown_for(iteration)).await;
        }
    }

    /// Bind a listening socket and accept inbound transports on a
    /// background task. Returns the bound address and the task handle.
    pub async fn listen(
        &self,
        addr: &str,
    ) -> overmesh_core::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound transport accepted");
                        Connection::spawn(
                            Box::new(TcpTransport::new(stream)),
                            HandshakeSide::Responder,
                            shared.clone(),
                        );
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    /// Bind every enabled listener resolved from the configuration store
    pub async fn listen_configured(
        &self,
        store: &dyn Store<ListenerEntry>,
    ) -> overmesh_core::Result<Vec<(SocketAddr, JoinHandle<()>)>> {
        let mut bound = Vec::new();
        for entry in store.stream() {
            if !entry.enabled {
                continue;
            }
            let addr = format!("{}:{}", entry.address, entry.port);
            bound.push(self.listen(&addr).await?);
        }
        Ok(bound)
    }

    // ------------------------------------------------------------------
    // Plugin events
    // ------------------------------------------------------------------

    /// Apply one plugin loader event to the exelet registrations and push
    /// the change into every live connection's dispatch table
    pub fn handle_plugin_event(&self, event: PluginEvent) {
        apply_plugin_event(&self.shared, event);
    }

    /// Consume plugin loader events from a channel on a background task
    pub fn attach_plugin_events(
        &self,
        mut events: mpsc::Receiver<PluginEvent>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                apply_plugin_event(&shared, event);
            }
        })
    }
}

fn apply_plugin_event(shared: &Arc<Shared>, event: PluginEvent) {
    match event {
        PluginEvent::Loaded { namespace, exelets } => {
            debug!(%namespace, count = exelets.len(), "plugin exelets registered");
            shared.exelets.register_plugin(namespace, exelets);
        }
        PluginEvent::Unloaded { namespace } => {
            debug!(%namespace, "plugin exelets revoked");
            shared.exelets.unregister_plugin(&namespace);
        }
    }
    shared.connections.refresh_dispatch_tables();
}
