//! Connection lifecycle and per-connection messaging
//!
//! A [`Connection`] owns one transport exclusively and is driven by a single
//! tokio task: the identity handshake runs first, then the task alternates
//! between flushing the outbound queue and dispatching inbound envelopes.
//! Transport faults never cross the public API as errors; they become the
//! closed state, fail every pending response future, and deregister the
//! connection from the stores.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use overmesh_core::envelope::Envelope;
use overmesh_core::future::{HandshakeFuture, MessageFuture, ResponseFuture};
use overmesh_core::handshake::{Handshake, SessionIdentity};
use overmesh_core::payload::Payload;
use overmesh_core::wire::{encode_frame, FrameDecoder};
use overmesh_core::{
    Cvid, HandshakeError, InstanceRole, OvermeshError, ProtocolConfig, RequestError,
};

use crate::exelet::{dispatch, DispatchMap, ExeletStore};
use crate::runtime::Shared;
use crate::transport::Transport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Handshake Side
// ----------------------------------------------------------------------------

/// Which side of the identity handshake this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// Announces itself and receives an assigned CVID
    Requester,
    /// Assigns the peer a CVID and reveals its own identity
    Responder,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// One logical connection between the local instance and a remote peer.
pub struct Connection {
    id: u64,
    outbound: mpsc::Sender<Envelope>,
    pending: Arc<DashMap<u32, MessageFuture>>,
    authenticated: AtomicBool,
    certificate_valid: AtomicBool,
    identity: OnceLock<SessionIdentity>,
    established: HandshakeFuture,
    table: RwLock<Option<Arc<DispatchMap>>>,
    exelets: Arc<ExeletStore>,
    protocol: ProtocolConfig,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    /// Wrap a transport and drive it on a new task. The returned connection
    /// is live immediately; await [`established`](Self::established) before
    /// sending application messages.
    pub(crate) fn spawn(
        transport: Box<dyn Transport>,
        side: HandshakeSide,
        shared: Arc<Shared>,
    ) -> Arc<Connection> {
        let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_buffer);
        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            pending: Arc::new(DashMap::new()),
            authenticated: AtomicBool::new(false),
            certificate_valid: AtomicBool::new(false),
            identity: OnceLock::new(),
            established: HandshakeFuture::new(),
            table: RwLock::new(None),
            exelets: shared.exelets.clone(),
            protocol: shared.config.protocol.clone(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        tokio::spawn(run_connection(
            connection.clone(),
            transport,
            outbound_rx,
            side,
            shared,
        ));
        connection
    }

    /// Monotonic identifier for this connection, used as the edge identity
    /// in the overlay graph
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The handshake-completion future
    pub fn established(&self) -> &HandshakeFuture {
        &self.established
    }

    /// The negotiated session identity, once established
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.get().cloned()
    }

    /// This side's session identifier on this connection
    pub fn local_cvid(&self) -> Cvid {
        self.identity
            .get()
            .map(|identity| identity.local_cvid)
            .unwrap_or(Cvid::NONE)
    }

    /// The peer's session identifier, once established
    pub fn remote_cvid(&self) -> Option<Cvid> {
        self.identity.get().map(|identity| identity.peer_cvid)
    }

    /// The peer's instance role, once established
    pub fn remote_role(&self) -> Option<InstanceRole> {
        self.identity.get().map(|identity| identity.peer_role)
    }

    /// The peer's permanent UUID, once established
    pub fn remote_uuid(&self) -> Option<String> {
        self.identity.get().map(|identity| identity.peer_uuid.clone())
    }

    /// Whether the handshake completed and the transport is still up
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.established.peek(), Some(Ok(_)))
    }

    /// Whether the connection is in the authenticated state
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the peer presented a valid certificate
    pub fn certificate_valid(&self) -> bool {
        self.certificate_valid.load(Ordering::SeqCst)
    }

    /// Record the outcome of certificate verification
    pub fn set_certificate_valid(&self, valid: bool) {
        self.certificate_valid.store(valid, Ordering::SeqCst);
    }

    /// Transition into the authenticated state and re-derive the handler
    /// table for the new level. Auth-gated handlers become visible here,
    /// not at dispatch time.
    pub fn authenticate(&self) -> overmesh_core::Result<()> {
        if !self.is_connected() {
            return Err(OvermeshError::state_error("connection is not established"));
        }
        if self.authenticated.swap(true, Ordering::SeqCst) {
            return Err(OvermeshError::state_error(
                "connection is already authenticated",
            ));
        }
        self.rebuild_table();
        Ok(())
    }

    /// Transition out of the authenticated state and re-derive the handler
    /// table
    pub fn deauthenticate(&self) -> overmesh_core::Result<()> {
        if !self.is_connected() {
            return Err(OvermeshError::state_error("connection is not established"));
        }
        if !self.authenticated.swap(false, Ordering::SeqCst) {
            return Err(OvermeshError::state_error(
                "connection is not authenticated",
            ));
        }
        self.rebuild_table();
        Ok(())
    }

    /// Enqueue an envelope for transmission. Never blocks; when the
    /// outbound queue is full the envelope is dropped with a warning, which
    /// is the only delivery guarantee this layer offers.
    pub fn send(&self, envelope: Envelope) {
        match self.outbound.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbound queue full; dropping envelope");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = self.id, "send on a closed connection");
            }
        }
    }

    /// Send a request and receive a typed response future. The pending
    /// future is registered before the envelope is handed to the transport,
    /// so a reply can never arrive before its waiter exists.
    pub fn request<T>(&self, payload: impl Into<Payload>) -> ResponseFuture<T>
    where
        T: TryFrom<Payload, Error = Payload>,
    {
        self.request_with_timeout(payload, self.protocol.message_timeout())
    }

    /// Send a request with an explicit response deadline
    pub fn request_with_timeout<T>(
        &self,
        payload: impl Into<Payload>,
        timeout: Duration,
    ) -> ResponseFuture<T>
    where
        T: TryFrom<Payload, Error = Payload>,
    {
        let envelope = Envelope::request(
            self.local_cvid(),
            self.remote_cvid().unwrap_or(Cvid::NONE),
            payload,
        );
        let future = self.read(envelope.correlation, Some(timeout));
        self.send(envelope);
        ResponseFuture::new(future)
    }

    /// Register a waiter for the envelope carrying the given correlation
    /// ID. Returns the existing future when one is already registered; only
    /// a fresh registration arms the timeout timer.
    pub fn read(&self, correlation: u32, timeout: Option<Duration>) -> MessageFuture {
        use dashmap::mapref::entry::Entry;

        let future = match self.pending.entry(correlation) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => {
                let future = MessageFuture::new();
                entry.insert(future.clone());
                future
            }
        };

        if let Some(timeout) = timeout {
            let pending = self.pending.clone();
            let timer_future = future.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                // The atomic remove is the first-writer-wins arbiter between
                // this timer and a matching reply.
                if pending.remove(&correlation).is_some() {
                    timer_future.fail(RequestError::Timeout(timeout));
                }
            });
        }
        future
    }

    /// Request the connection task to shut down
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Number of responses still awaited
    pub fn pending_responses(&self) -> usize {
        self.pending.len()
    }

    // ------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------

    /// Queue a handler reply for the given requester and correlation ID
    pub(crate) fn send_reply(&self, to: Cvid, correlation: u32, payload: Payload) {
        if correlation == 0 {
            debug!("handler replied to a one-way envelope; dropping the reply");
            return;
        }
        self.send(Envelope {
            from: self.local_cvid(),
            to,
            correlation,
            payload,
        });
    }

    pub(crate) fn take_pending(&self, correlation: u32) -> Option<MessageFuture> {
        self.pending.remove(&correlation).map(|(_, future)| future)
    }

    pub(crate) fn dispatch_snapshot(&self) -> Option<Arc<DispatchMap>> {
        self.table.read().unwrap().clone()
    }

    /// Derive the handler table for the current remote role and auth level
    pub(crate) fn rebuild_table(&self) {
        let Some(identity) = self.identity.get() else {
            return;
        };
        let table = self
            .exelets
            .build_table(identity.peer_role, self.is_authenticated());
        *self.table.write().unwrap() = Some(table);
    }

    fn clear_table(&self) {
        *self.table.write().unwrap() = None;
    }

    fn fail_pending(&self) {
        let correlations: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for correlation in correlations {
            if let Some((_, future)) = self.pending.remove(&correlation) {
                future.fail(RequestError::ConnectionClosed);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Task
// ----------------------------------------------------------------------------

async fn run_connection(
    connection: Arc<Connection>,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::Receiver<Envelope>,
    side: HandshakeSide,
    shared: Arc<Shared>,
) {
    let protocol = connection.protocol.clone();
    let mut decoder = FrameDecoder::new(protocol.max_frame_size);

    let handshake = tokio::time::timeout(
        protocol.handshake_timeout(),
        perform_handshake(transport.as_mut(), &mut decoder, side, &shared, &protocol),
    )
    .await
    .unwrap_or(Err(HandshakeError::TimedOut(protocol.handshake_timeout())));

    let identity = match handshake {
        Ok(identity) => identity,
        Err(error) => {
            warn!(transport = %transport.description(), %error, "handshake failed");
            connection.established.fail(error);
            let _ = transport.close().await;
            return;
        }
    };

    // Non-server requesters adopt the CVID assigned for this session.
    if side == HandshakeSide::Requester && shared.local.role != InstanceRole::Server {
        shared.local.set_cvid(identity.local_cvid);
        shared.network.set_local(identity.local_cvid);
    }

    // Register everywhere before resolving the handshake future, so a
    // caller woken by it already sees the connection in the stores.
    let _ = connection.identity.set(identity.clone());
    connection.rebuild_table();
    shared.connections.insert(connection.clone());
    shared.network.on_established(identity.peer_cvid, connection.id);
    connection.established.complete(identity.clone());
    info!(
        peer = %identity.peer_cvid,
        role = %identity.peer_role,
        transport = %transport.description(),
        "connection established"
    );

    // Envelopes that shared a chunk with the final handshake frame are
    // already buffered; dispatch them before waiting for more bytes.
    let healthy = drain_frames(&connection, &mut decoder);

    while healthy {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(envelope) => match encode_frame(&envelope, protocol.max_frame_size) {
                    Ok(frame) => {
                        if let Err(error) = transport.send(&frame).await {
                            debug!(connection = connection.id, %error, "transport write failed");
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "failed to encode outbound envelope"),
                },
                None => break,
            },
            chunk = transport.recv() => match chunk {
                Ok(Some(bytes)) => {
                    decoder.feed(&bytes);
                    if !drain_frames(&connection, &mut decoder) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(connection = connection.id, "transport closed by peer");
                    break;
                }
                Err(error) => {
                    debug!(connection = connection.id, %error, "transport fault");
                    break;
                }
            },
            _ = connection.shutdown.notified() => break,
        }
    }

    let _ = transport.close().await;
    connection.closed.store(true, Ordering::SeqCst);
    connection.clear_table();
    connection.fail_pending();
    shared.connections.remove(&connection);
    shared.network.on_lost(identity.peer_cvid, connection.id);
    info!(peer = %identity.peer_cvid, "connection closed");
}

/// Dispatch every buffered envelope. Returns `false` when the stream has
/// lost frame alignment and the connection must close.
fn drain_frames(connection: &Arc<Connection>, decoder: &mut FrameDecoder) -> bool {
    loop {
        match decoder.next_frame() {
            Ok(Some(envelope)) => dispatch(connection, envelope),
            Ok(None) => return true,
            Err(error) if error.is_recoverable() => {
                warn!(%error, "dropping malformed envelope");
            }
            Err(error) => {
                warn!(%error, "unrecoverable framing fault");
                return false;
            }
        }
    }
}

/// Drive the handshake state machine over the raw transport. All transport
/// faults surface as [`HandshakeError::Closed`].
async fn perform_handshake(
    transport: &mut dyn Transport,
    decoder: &mut FrameDecoder,
    side: HandshakeSide,
    shared: &Arc<Shared>,
    protocol: &ProtocolConfig,
) -> Result<SessionIdentity, HandshakeError> {
    let mut machine = match side {
        HandshakeSide::Requester => {
            let (machine, announcement) =
                Handshake::requester(shared.local.role, shared.local.uuid.clone());
            send_handshake_frame(transport, &announcement, protocol).await?;
            machine
        }
        HandshakeSide::Responder => {
            Handshake::responder(shared.local.cvid(), shared.local.uuid.clone())
        }
    };

    loop {
        loop {
            let envelope = match decoder.next_frame() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(error) => {
                    debug!(%error, "undecodable frame during handshake");
                    return Err(HandshakeError::Closed);
                }
            };

            let (next, reply) = machine.receive(&envelope);
            machine = next;
            if let Some(reply) = reply {
                send_handshake_frame(transport, &reply, protocol).await?;
            }

            match &machine {
                Handshake::Established(identity) => return Ok(identity.clone()),
                Handshake::Failed(error) => return Err(error.clone()),
                _ => {}
            }
        }

        match transport.recv().await {
            Ok(Some(bytes)) => decoder.feed(&bytes),
            Ok(None) => return Err(HandshakeError::Closed),
            Err(error) => {
                debug!(%error, "transport fault during handshake");
                return Err(HandshakeError::Closed);
            }
        }
    }
}

async fn send_handshake_frame(
    transport: &mut dyn Transport,
    envelope: &Envelope,
    protocol: &ProtocolConfig,
) -> Result<(), HandshakeError> {
    let frame =
        encode_frame(envelope, protocol.max_frame_size).map_err(|_| HandshakeError::Closed)?;
    transport
        .send(&frame)
        .await
        .map_err(|_| HandshakeError::Closed)
}
