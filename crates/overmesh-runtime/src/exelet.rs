//! Exelet registration and message dispatch
//!
//! An exelet is a named bundle of message handlers declared with an explicit
//! builder: each handler names the payload kind it accepts, whether it
//! requires authentication, which remote instance roles may invoke it, and
//! how it executes. The [`ExeletStore`] holds all registrations; every
//! connection derives a [`DispatchMap`] snapshot for its negotiated remote
//! role and current authentication level.
//!
//! Dispatch never tears down a connection: a handler error is logged, an
//! envelope nobody wants is dropped with a warning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use smallvec::SmallVec;
use tracing::{debug, warn};

use overmesh_core::envelope::Envelope;
use overmesh_core::payload::{Echo, EchoReply, Outcome, Payload, PayloadKind, Pong};
use overmesh_core::{Cvid, InstanceRole, Result};

use crate::connection::Connection;

/// Roles slice accepting every instance role.
pub const ALL_ROLES: &[InstanceRole] = &[
    InstanceRole::Agent,
    InstanceRole::Server,
    InstanceRole::Client,
];

// ----------------------------------------------------------------------------
// Handler Metadata
// ----------------------------------------------------------------------------

/// Authentication gate for one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    /// Available on any live connection
    Unauth,
    /// Available only after [`Connection::authenticate`]
    Auth,
}

/// Where a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the connection's reader task; must not block
    Inline,
    /// On the blocking pool, for longer-running work
    Pooled,
}

/// Dispatch key for one handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    /// A first-class payload kind
    Kind(PayloadKind),
    /// A plugin-namespaced extension message
    Extension { namespace: String, name: String },
}

// ----------------------------------------------------------------------------
// Handler Shapes
// ----------------------------------------------------------------------------

type ConsumeFn = Arc<dyn Fn(Payload) -> Result<()> + Send + Sync>;
type ReplyFn = Arc<dyn Fn(Payload) -> Result<Option<Payload>> + Send + Sync>;
type ContextConsumeFn = Arc<dyn Fn(&mut ExeletContext, Payload) -> Result<()> + Send + Sync>;
type ContextReplyFn =
    Arc<dyn Fn(&mut ExeletContext, Payload) -> Result<Option<Payload>> + Send + Sync>;

/// The four supported handler shapes.
#[derive(Clone)]
pub enum HandlerFn {
    /// Consume the payload, no reply
    Consume(ConsumeFn),
    /// Consume and optionally reply; the reply is wrapped as a response to
    /// the request's correlation ID
    Reply(ReplyFn),
    /// Context-aware consumer: may set one reply and one deferred action
    ContextConsume(ContextConsumeFn),
    /// Context-aware replier: the returned payload wins over a context reply
    ContextReply(ContextReplyFn),
}

/// One registered handler with its metadata.
#[derive(Clone)]
pub struct HandlerSpec {
    pub key: HandlerKey,
    pub auth: AuthRequirement,
    pub roles: SmallVec<[InstanceRole; 3]>,
    pub exec: ExecutionMode,
    pub handler: HandlerFn,
}

// ----------------------------------------------------------------------------
// Exelet Context
// ----------------------------------------------------------------------------

/// Mutable per-dispatch context handed to context-aware handlers.
///
/// Allows a single reply plus one deferred action that runs after the reply
/// has been queued (e.g. closing the connection after the ack).
pub struct ExeletContext {
    connection: Arc<Connection>,
    origin: Cvid,
    correlation: u32,
    reply: Option<Payload>,
    deferred: Option<Box<dyn FnOnce() + Send>>,
}

impl ExeletContext {
    fn new(connection: Arc<Connection>, origin: Cvid, correlation: u32) -> Self {
        ExeletContext {
            connection,
            origin,
            correlation,
            reply: None,
            deferred: None,
        }
    }

    /// The connection the request arrived on
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The requester's session identifier
    pub fn origin(&self) -> Cvid {
        self.origin
    }

    /// Set the reply payload. Only the first reply is kept.
    pub fn set_reply(&mut self, payload: impl Into<Payload>) {
        if self.reply.is_some() {
            warn!("exelet context reply already set; keeping the first");
            return;
        }
        self.reply = Some(payload.into());
    }

    /// Schedule an action to run after the reply has been queued. Only the
    /// first deferred action is kept.
    pub fn defer(&mut self, action: impl FnOnce() + Send + 'static) {
        if self.deferred.is_some() {
            warn!("exelet context deferred action already set; keeping the first");
            return;
        }
        self.deferred = Some(Box::new(action));
    }

    /// Queue the winning reply, then run the deferred action.
    fn finish(mut self, returned: Option<Payload>) {
        let reply = returned.or_else(|| self.reply.take());
        if let Some(payload) = reply {
            self.connection
                .send_reply(self.origin, self.correlation, payload);
        }
        if let Some(action) = self.deferred.take() {
            action();
        }
    }
}

// ----------------------------------------------------------------------------
// Exelets
// ----------------------------------------------------------------------------

/// A named bundle of handler registrations.
#[derive(Clone)]
pub struct Exelet {
    name: &'static str,
    handlers: Vec<HandlerSpec>,
}

impl Exelet {
    /// Start building an exelet
    pub fn builder(name: &'static str) -> ExeletBuilder {
        ExeletBuilder {
            name,
            handlers: Vec::new(),
        }
    }

    /// The exelet's name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The registered handlers
    pub fn handlers(&self) -> &[HandlerSpec] {
        &self.handlers
    }
}

/// Builder for [`Exelet`]. Handlers default to [`ExecutionMode::Inline`];
/// call [`pooled`](Self::pooled) directly after adding a handler to move it
/// to the blocking pool.
pub struct ExeletBuilder {
    name: &'static str,
    handlers: Vec<HandlerSpec>,
}

impl ExeletBuilder {
    fn push(mut self, key: HandlerKey, auth: AuthRequirement, roles: &[InstanceRole], handler: HandlerFn) -> Self {
        self.handlers.push(HandlerSpec {
            key,
            auth,
            roles: SmallVec::from_slice(roles),
            exec: ExecutionMode::Inline,
            handler,
        });
        self
    }

    /// Register a consume-only handler
    pub fn consume(
        self,
        kind: PayloadKind,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(Payload) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Kind(kind),
            auth,
            roles,
            HandlerFn::Consume(Arc::new(handler)),
        )
    }

    /// Register a consume-and-reply handler
    pub fn reply(
        self,
        kind: PayloadKind,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(Payload) -> Result<Option<Payload>> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Kind(kind),
            auth,
            roles,
            HandlerFn::Reply(Arc::new(handler)),
        )
    }

    /// Register a context-aware consumer
    pub fn consume_in_context(
        self,
        kind: PayloadKind,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(&mut ExeletContext, Payload) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Kind(kind),
            auth,
            roles,
            HandlerFn::ContextConsume(Arc::new(handler)),
        )
    }

    /// Register a context-aware replier
    pub fn reply_in_context(
        self,
        kind: PayloadKind,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(&mut ExeletContext, Payload) -> Result<Option<Payload>> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Kind(kind),
            auth,
            roles,
            HandlerFn::ContextReply(Arc::new(handler)),
        )
    }

    /// Register a consume-only handler for a plugin extension message
    pub fn extension_consume(
        self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(Payload) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Extension {
                namespace: namespace.into(),
                name: name.into(),
            },
            auth,
            roles,
            HandlerFn::Consume(Arc::new(handler)),
        )
    }

    /// Register a consume-and-reply handler for a plugin extension message
    pub fn extension_reply(
        self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        auth: AuthRequirement,
        roles: &[InstanceRole],
        handler: impl Fn(Payload) -> Result<Option<Payload>> + Send + Sync + 'static,
    ) -> Self {
        self.push(
            HandlerKey::Extension {
                namespace: namespace.into(),
                name: name.into(),
            },
            auth,
            roles,
            HandlerFn::Reply(Arc::new(handler)),
        )
    }

    /// Move the most recently added handler to the blocking pool
    pub fn pooled(mut self) -> Self {
        if let Some(last) = self.handlers.last_mut() {
            last.exec = ExecutionMode::Pooled;
        }
        self
    }

    /// Finish the exelet
    pub fn build(self) -> Exelet {
        Exelet {
            name: self.name,
            handlers: self.handlers,
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Map
// ----------------------------------------------------------------------------

/// An immutable handler-table snapshot for one connection.
///
/// Built for a specific remote role and authentication level; handlers whose
/// requirements are not met are simply absent, so gating needs no check at
/// dispatch time.
#[derive(Default)]
pub struct DispatchMap {
    by_kind: HashMap<PayloadKind, HandlerSpec>,
    by_extension: HashMap<String, HashMap<String, HandlerSpec>>,
}

impl DispatchMap {
    /// Find the handler for a payload, if one is registered
    pub fn lookup(&self, payload: &Payload) -> Option<&HandlerSpec> {
        match payload {
            Payload::Extension(extension) => self
                .by_extension
                .get(&extension.namespace)
                .and_then(|names| names.get(&extension.name)),
            other => self.by_kind.get(&other.kind()),
        }
    }

    /// Number of handlers in the snapshot
    pub fn len(&self) -> usize {
        self.by_kind.len() + self.by_extension.values().map(HashMap::len).sum::<usize>()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, spec: HandlerSpec) {
        match spec.key.clone() {
            HandlerKey::Kind(kind) => {
                if self.by_kind.insert(kind, spec).is_some() {
                    debug!(?kind, "duplicate handler registration; last wins");
                }
            }
            HandlerKey::Extension { namespace, name } => {
                if self
                    .by_extension
                    .entry(namespace)
                    .or_default()
                    .insert(name, spec)
                    .is_some()
                {
                    debug!("duplicate extension handler registration; last wins");
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Exelet Store
// ----------------------------------------------------------------------------

struct RegisteredExelet {
    /// Plugin namespace, or `None` for exelets registered at startup
    namespace: Option<String>,
    exelet: Exelet,
}

/// All exelets known to one runtime.
///
/// Registrations are additive (startup, plugin load) and revocable (plugin
/// unload). Connections derive table snapshots from the current set; the
/// store itself is never consulted on the dispatch hot path.
#[derive(Default)]
pub struct ExeletStore {
    registered: RwLock<Vec<RegisteredExelet>>,
}

impl ExeletStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exelet at startup
    pub fn register(&self, exelet: Exelet) {
        self.registered.write().unwrap().push(RegisteredExelet {
            namespace: None,
            exelet,
        });
    }

    /// Register a plugin's exelets under its namespace
    pub fn register_plugin(&self, namespace: impl Into<String>, exelets: Vec<Exelet>) {
        let namespace = namespace.into();
        let mut registered = self.registered.write().unwrap();
        for exelet in exelets {
            registered.push(RegisteredExelet {
                namespace: Some(namespace.clone()),
                exelet,
            });
        }
    }

    /// Revoke every exelet registered under a plugin namespace
    pub fn unregister_plugin(&self, namespace: &str) {
        self.registered
            .write()
            .unwrap()
            .retain(|entry| entry.namespace.as_deref() != Some(namespace));
    }

    /// Revoke an exelet by name
    pub fn unregister(&self, name: &str) {
        self.registered
            .write()
            .unwrap()
            .retain(|entry| entry.exelet.name() != name);
    }

    /// Build the table snapshot for a connection with the given negotiated
    /// remote role and authentication level. In the event of multiple
    /// registrations for one payload kind, the last registration wins.
    pub fn build_table(&self, remote_role: InstanceRole, authenticated: bool) -> Arc<DispatchMap> {
        let mut map = DispatchMap::default();
        for entry in self.registered.read().unwrap().iter() {
            for spec in entry.exelet.handlers() {
                if !spec.roles.contains(&remote_role) {
                    continue;
                }
                if spec.auth == AuthRequirement::Auth && !authenticated {
                    continue;
                }
                map.insert(spec.clone());
            }
        }
        Arc::new(map)
    }
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

/// Route one inbound envelope: handler table first, then the pending
/// response table, otherwise drop with a warning.
pub(crate) fn dispatch(connection: &Arc<Connection>, envelope: Envelope) {
    if let Some(table) = connection.dispatch_snapshot() {
        if let Some(spec) = table.lookup(&envelope.payload) {
            let spec = spec.clone();
            match spec.exec {
                ExecutionMode::Inline => invoke(spec, connection.clone(), envelope),
                ExecutionMode::Pooled => {
                    let connection = connection.clone();
                    tokio::task::spawn_blocking(move || invoke(spec, connection, envelope));
                }
            }
            return;
        }
    }

    if envelope.correlation != 0 {
        if let Some(future) = connection.take_pending(envelope.correlation) {
            let correlation = envelope.correlation;
            if !future.complete(envelope) {
                debug!(correlation, "response future was already resolved");
            }
            return;
        }
    }

    warn!(
        kind = ?envelope.payload.kind(),
        correlation = envelope.correlation,
        "dropping envelope with no handler and no waiter"
    );
}

fn invoke(spec: HandlerSpec, connection: Arc<Connection>, envelope: Envelope) {
    let origin = envelope.from;
    let correlation = envelope.correlation;
    let expects_reply = envelope.expects_reply();

    match spec.handler {
        HandlerFn::Consume(handler) => {
            if let Err(error) = handler(envelope.payload) {
                warn!(%error, "message handler failed");
            }
        }
        HandlerFn::Reply(handler) => match handler(envelope.payload) {
            Ok(Some(reply)) => connection.send_reply(origin, correlation, reply),
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "message handler failed");
                if expects_reply {
                    connection.send_reply(
                        origin,
                        correlation,
                        Outcome::failure(error.to_string()).into(),
                    );
                }
            }
        },
        HandlerFn::ContextConsume(handler) => {
            let mut context = ExeletContext::new(connection, origin, correlation);
            if let Err(error) = handler(&mut context, envelope.payload) {
                warn!(%error, "message handler failed");
            }
            context.finish(None);
        }
        HandlerFn::ContextReply(handler) => {
            let mut context = ExeletContext::new(connection, origin, correlation);
            match handler(&mut context, envelope.payload) {
                Ok(reply) => context.finish(reply),
                Err(error) => {
                    warn!(%error, "message handler failed");
                    if expects_reply {
                        context.finish(Some(Outcome::failure(error.to_string()).into()));
                    } else {
                        context.finish(None);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Core Exelet
// ----------------------------------------------------------------------------

/// The built-in handler set every instance may register: liveness probes
/// for anyone, diagnostics for authenticated peers.
pub fn core_exelet() -> Exelet {
    Exelet::builder("core")
        .reply(
            PayloadKind::Ping,
            AuthRequirement::Unauth,
            ALL_ROLES,
            |_payload| Ok(Some(Pong.into())),
        )
        .reply(
            PayloadKind::Echo,
            AuthRequirement::Auth,
            ALL_ROLES,
            |payload| {
                let echo = Echo::try_from(payload)
                    .map_err(|_| overmesh_core::OvermeshError::handler_error("expected an echo"))?;
                Ok(Some(EchoReply { data: echo.data }.into()))
            },
        )
        .build()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn marker_exelet(name: &'static str, hits: Arc<AtomicUsize>) -> Exelet {
        Exelet::builder(name)
            .consume(
                PayloadKind::Ping,
                AuthRequirement::Unauth,
                ALL_ROLES,
                move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .build()
    }

    #[test]
    fn test_table_filters_by_role() {
        let store = ExeletStore::new();
        store.register(
            Exelet::builder("server-only")
                .consume(
                    PayloadKind::Ping,
                    AuthRequirement::Unauth,
                    &[InstanceRole::Server],
                    |_| Ok(()),
                )
                .build(),
        );

        let server_table = store.build_table(InstanceRole::Server, false);
        let agent_table = store.build_table(InstanceRole::Agent, false);

        assert!(server_table.lookup(&Payload::Ping(Default::default())).is_some());
        assert!(agent_table.lookup(&Payload::Ping(Default::default())).is_none());
    }

    #[test]
    fn test_table_filters_by_auth_level() {
        let store = ExeletStore::new();
        store.register(core_exelet());

        let unauth = store.build_table(InstanceRole::Client, false);
        let auth = store.build_table(InstanceRole::Client, true);

        let echo: Payload = Echo { data: "x".into() }.into();
        assert!(unauth.lookup(&echo).is_none());
        assert!(auth.lookup(&echo).is_some());

        // Ping stays visible at both levels.
        let ping: Payload = Payload::Ping(Default::default());
        assert!(unauth.lookup(&ping).is_some());
        assert!(auth.lookup(&ping).is_some());
    }

    #[test]
    fn test_last_registration_wins() {
        let store = ExeletStore::new();
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        store.register(marker_exelet("first", first_hits.clone()));
        store.register(marker_exelet("second", second_hits.clone()));

        let table = store.build_table(InstanceRole::Agent, false);
        let spec = table.lookup(&Payload::Ping(Default::default())).unwrap();

        if let HandlerFn::Consume(handler) = &spec.handler {
            handler(Payload::Ping(Default::default())).unwrap();
        } else {
            panic!("expected a consume handler");
        }

        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plugin_unregistration_removes_handlers() {
        let store = ExeletStore::new();
        store.register_plugin(
            "com.example.shell",
            vec![Exelet::builder("shell")
                .extension_reply(
                    "com.example.shell",
                    "rq_execute",
                    AuthRequirement::Unauth,
                    ALL_ROLES,
                    |_| Ok(Some(Outcome::success().into())),
                )
                .build()],
        );

        let extension: Payload = overmesh_core::payload::Extension {
            namespace: "com.example.shell".into(),
            name: "rq_execute".into(),
            data: Vec::new(),
        }
        .into();

        let table = store.build_table(InstanceRole::Client, false);
        assert!(table.lookup(&extension).is_some());

        store.unregister_plugin("com.example.shell");
        let rebuilt = store.build_table(InstanceRole::Client, false);
        assert!(rebuilt.lookup(&extension).is_none());

        // The snapshot taken before unregistration is untouched, so
        // in-flight dispatch never observes a partial table.
        assert!(table.lookup(&extension).is_some());
    }

    #[test]
    fn test_unregister_by_name() {
        let store = ExeletStore::new();
        store.register(core_exelet());
        store.register(
            Exelet::builder("extra")
                .consume(
                    PayloadKind::Pong,
                    AuthRequirement::Unauth,
                    ALL_ROLES,
                    |_| Ok(()),
                )
                .build(),
        );

        store.unregister("extra");
        let table = store.build_table(InstanceRole::Agent, false);
        assert!(table.lookup(&Payload::Pong(Default::default())).is_none());
        assert!(table.lookup(&Payload::Ping(Default::default())).is_some());
    }

    #[test]
    fn test_pooled_marks_most_recent_handler() {
        let exelet = Exelet::builder("mixed")
            .consume(
                PayloadKind::Ping,
                AuthRequirement::Unauth,
                ALL_ROLES,
                |_| Ok(()),
            )
            .consume(
                PayloadKind::Pong,
                AuthRequirement::Unauth,
                ALL_ROLES,
                |_| Ok(()),
            )
            .pooled()
            .build();

        assert_eq!(exelet.handlers()[0].exec, ExecutionMode::Inline);
        assert_eq!(exelet.handlers()[1].exec, ExecutionMode::Pooled);
    }

    #[test]
    fn test_snapshot_isolated_from_later_registrations() {
        let store = ExeletStore::new();
        let before = store.build_table(InstanceRole::Agent, false);
        store.register(core_exelet());
        let after = store.build_table(InstanceRole::Agent, false);

        assert!(before.is_empty());
        assert!(!after.is_empty());
    }
}
