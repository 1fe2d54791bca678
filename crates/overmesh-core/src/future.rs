//! Request/response correlation futures
//!
//! [`FutureCell`] is the shared completion primitive: it resolves exactly
//! once, from any task, and runs its listeners exactly once each, serialized
//! per cell. [`MessageFuture`] and [`HandshakeFuture`] are its two concrete
//! protocol uses. [`ResponseFuture`] adds typed payload extraction and
//! [`CommandFuture`] aggregates several exchanges into one logical command.

use std::any::type_name;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::envelope::Envelope;
use crate::errors::{HandshakeError, RequestError};
use crate::handshake::SessionIdentity;
use crate::payload::{Outcome, Payload};

// ----------------------------------------------------------------------------
// Completion Cell
// ----------------------------------------------------------------------------

type Listener<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

struct ListenerState<T, E> {
    queue: Vec<Listener<T, E>>,
    /// True while some task is draining the queue. At most one task
    /// notifies at a time; everyone else appends to the queue.
    notifying: bool,
}

struct CellInner<T, E> {
    listeners: Mutex<ListenerState<T, E>>,
    /// The resolved value; also wakes waiters.
    slot: watch::Sender<Option<Result<T, E>>>,
}

/// A completion cell that resolves exactly once.
///
/// Cloning yields another handle to the same cell. The first call to
/// [`complete`](Self::complete) or [`fail`](Self::fail) wins; later attempts
/// are detectable no-ops returning `false`.
pub struct FutureCell<T, E> {
    inner: Arc<CellInner<T, E>>,
}

impl<T, E> Clone for FutureCell<T, E> {
    fn clone(&self) -> Self {
        FutureCell {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for FutureCell<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> FutureCell<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an unresolved cell
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        FutureCell {
            inner: Arc::new(CellInner {
                listeners: Mutex::new(ListenerState {
                    queue: Vec::new(),
                    notifying: false,
                }),
                slot,
            }),
        }
    }

    /// Resolve successfully. Returns `false` if the cell was already
    /// resolved.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Resolve with a failure. Returns `false` if the cell was already
    /// resolved.
    pub fn fail(&self, error: E) -> bool {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<T, E>) -> bool {
        {
            let mut state = self.inner.listeners.lock().unwrap();
            let mut won = false;
            self.inner.slot.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(result.clone());
                    won = true;
                    true
                } else {
                    false
                }
            });
            if !won {
                return false;
            }
            state.notifying = true;
        }
        self.drain_listeners(&result);
        true
    }

    /// Run queued listeners until the queue stays empty, then release the
    /// notifier role. Listeners run outside the lock, so a listener may
    /// safely register further listeners.
    fn drain_listeners(&self, result: &Result<T, E>) {
        loop {
            let batch = {
                let mut state = self.inner.listeners.lock().unwrap();
                if state.queue.is_empty() {
                    state.notifying = false;
                    return;
                }
                std::mem::take(&mut state.queue)
            };
            for listener in batch {
                listener(result);
            }
        }
    }

    /// Whether the cell has resolved
    pub fn is_resolved(&self) -> bool {
        self.inner.slot.borrow().is_some()
    }

    /// The resolved value, if any
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.inner.slot.borrow().clone()
    }

    /// Register a listener, invoked exactly once on resolution (success or
    /// failure). Listeners added after resolution run immediately in the
    /// adding task, still serialized with any in-flight invocation.
    pub fn on_resolved(&self, listener: impl FnOnce(&Result<T, E>) + Send + 'static) {
        let result = {
            let mut state = self.inner.listeners.lock().unwrap();
            match self.inner.slot.borrow().clone() {
                None => {
                    state.queue.push(Box::new(listener));
                    return;
                }
                Some(result) => {
                    if state.notifying {
                        // An in-flight drain will pick this one up.
                        state.queue.push(Box::new(listener));
                        return;
                    }
                    state.notifying = true;
                    result
                }
            }
        };

        listener(&result);
        self.drain_listeners(&result);
    }

    /// Suspend until the cell resolves
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.inner.slot.subscribe();
        loop {
            if let Some(result) = self.peek() {
                return result;
            }
            // The sender lives inside `self.inner`, so this cannot close
            // while we hold a handle.
            let _ = rx.changed().await;
        }
    }
}

/// Completion of one awaited envelope.
pub type MessageFuture = FutureCell<Envelope, RequestError>;

/// Completion of a connection's identity handshake.
pub type HandshakeFuture = FutureCell<SessionIdentity, HandshakeError>;

// ----------------------------------------------------------------------------
// Typed Response Future
// ----------------------------------------------------------------------------

/// A typed view over a [`MessageFuture`].
///
/// Extraction failure resolves to [`RequestError::InvalidResponse`] rather
/// than panicking; a failed [`Outcome`] reply surfaces as
/// [`RequestError::Rejected`].
pub struct ResponseFuture<T> {
    future: MessageFuture,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ResponseFuture<T>
where
    T: TryFrom<Payload, Error = Payload>,
{
    /// Wrap an envelope future
    pub fn new(future: MessageFuture) -> Self {
        ResponseFuture {
            future,
            _marker: PhantomData,
        }
    }

    /// The underlying envelope future
    pub fn message_future(&self) -> &MessageFuture {
        &self.future
    }

    /// Await the response and extract the expected payload type
    pub async fn get(&self) -> Result<T, RequestError> {
        let envelope = self.future.wait().await?;
        Self::extract(envelope.payload)
    }

    fn extract(payload: Payload) -> Result<T, RequestError> {
        let kind = payload.kind();
        match T::try_from(payload) {
            Ok(value) => Ok(value),
            Err(Payload::Outcome(Outcome {
                success: false,
                message,
            })) => Err(RequestError::Rejected(message.unwrap_or_default())),
            Err(_) => Err(RequestError::InvalidResponse {
                expected: type_name::<T>(),
                actual: kind,
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Command Future
// ----------------------------------------------------------------------------

struct CommandState {
    outstanding: usize,
    components: Vec<AbortHandle>,
}

struct CommandInner {
    state: Mutex<CommandState>,
    cell: FutureCell<(), RequestError>,
}

/// Aggregates several concurrent request/response exchanges under one
/// logical command.
///
/// The command succeeds once every added component has succeeded; the first
/// component failure fails the aggregate and aborts the remaining in-flight
/// components. Abortion is local bookkeeping only; remote-side operations
/// are not cancelled.
#[derive(Clone)]
pub struct CommandFuture {
    inner: Arc<CommandInner>,
}

impl Default for CommandFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandFuture {
    /// Create an empty command
    pub fn new() -> Self {
        CommandFuture {
            inner: Arc::new(CommandInner {
                state: Mutex::new(CommandState {
                    outstanding: 0,
                    components: Vec::new(),
                }),
                cell: FutureCell::new(),
            }),
        }
    }

    /// Add a component exchange. `handler` runs on the component's success;
    /// the component completes the command when it is the last one out.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add<T, F>(&self, response: ResponseFuture<T>, handler: F)
    where
        T: TryFrom<Payload, Error = Payload> + Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.inner.state.lock().unwrap().outstanding += 1;

        let command = self.clone();
        let task = tokio::spawn(async move {
            match response.get().await {
                Ok(value) => {
                    handler(value);
                    command.component_done();
                }
                Err(error) => command.fail(error),
            }
        });

        self.inner
            .state
            .lock()
            .unwrap()
            .components
            .push(task.abort_handle());
    }

    fn component_done(&self) {
        let finished = {
            let mut state = self.inner.state.lock().unwrap();
            state.outstanding -= 1;
            state.outstanding == 0
        };
        if finished {
            self.inner.cell.complete(());
        }
    }

    fn fail(&self, error: RequestError) {
        // Record the failure before aborting, since the failing component's
        // own task is among the abort targets.
        self.inner.cell.fail(error);
        let components = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.components)
        };
        for component in components {
            component.abort();
        }
    }

    /// Abort every outstanding component and fail the command
    pub fn abort(&self) {
        self.fail(RequestError::Aborted);
    }

    /// Whether the command has resolved
    pub fn is_resolved(&self) -> bool {
        self.inner.cell.is_resolved()
    }

    /// The resolved result, if any
    pub fn peek(&self) -> Option<Result<(), RequestError>> {
        self.inner.cell.peek()
    }

    /// Suspend until the command resolves
    pub async fn wait(&self) -> Result<(), RequestError> {
        self.inner.cell.wait().await
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::cvid::{Cvid, InstanceRole};
    use crate::payload::{EchoReply, Ping, Pong};

    fn pong_envelope(correlation: u32) -> Envelope {
        Envelope {
            from: Cvid::generate(InstanceRole::Server),
            to: Cvid::generate(InstanceRole::Agent),
            correlation,
            payload: Pong.into(),
        }
    }

    #[test]
    fn test_exactly_once_completion() {
        let future = MessageFuture::new();

        assert!(future.complete(pong_envelope(1)));
        assert!(!future.complete(pong_envelope(2)), "second completion must lose");
        assert!(!future.fail(RequestError::Aborted));

        let envelope = future.peek().unwrap().unwrap();
        assert_eq!(envelope.correlation, 1);
    }

    #[test]
    fn test_listener_runs_once_per_registration() {
        let future = MessageFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        future.on_resolved(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        future.complete(pong_envelope(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A listener added after resolution runs immediately.
        let counter = calls.clone();
        future.on_resolved(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // A losing completion attempt must not re-run listeners.
        future.fail(RequestError::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_observes_prior_completion() {
        let future = MessageFuture::new();
        future.complete(pong_envelope(3));

        let envelope = future.wait().await.unwrap();
        assert_eq!(envelope.correlation, 3);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_late_completion() {
        let future = MessageFuture::new();
        let waiter = future.clone();

        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        future.fail(RequestError::ConnectionClosed);

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err(), RequestError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_response_future_extracts_expected_type() {
        let future = MessageFuture::new();
        let response: ResponseFuture<Pong> = ResponseFuture::new(future.clone());

        future.complete(pong_envelope(9));
        response.get().await.unwrap();
    }

    #[tokio::test]
    async fn test_response_future_rejects_wrong_type() {
        let future = MessageFuture::new();
        let response: ResponseFuture<EchoReply> = ResponseFuture::new(future.clone());

        future.complete(pong_envelope(4));
        match response.get().await {
            Err(RequestError::InvalidResponse { actual, .. }) => {
                assert_eq!(actual, crate::payload::PayloadKind::Pong);
            }
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_future_surfaces_failed_outcome() {
        let future = MessageFuture::new();
        let response: ResponseFuture<Pong> = ResponseFuture::new(future.clone());

        let mut envelope = pong_envelope(5);
        envelope.payload = Outcome::failure("permission denied").into();
        future.complete(envelope);

        match response.get().await {
            Err(RequestError::Rejected(message)) => assert_eq!(message, "permission denied"),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_future_succeeds_when_all_components_do() {
        let command = CommandFuture::new();
        let first = MessageFuture::new();
        let second = MessageFuture::new();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        command.add(ResponseFuture::<Pong>::new(first.clone()), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = seen.clone();
        command.add(ResponseFuture::<Pong>::new(second.clone()), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        first.complete(pong_envelope(1));
        second.complete(pong_envelope(2));

        command.wait().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_command_future_fails_fast_on_component_failure() {
        let command = CommandFuture::new();
        let first = MessageFuture::new();
        let second = MessageFuture::new();

        command.add(ResponseFuture::<Pong>::new(first.clone()), |_| {});
        command.add(ResponseFuture::<Pong>::new(second.clone()), |_| {
            panic!("aborted component handler must never run");
        });

        first.fail(RequestError::Timeout(Duration::from_millis(200)));

        let error = command.wait().await.unwrap_err();
        assert_eq!(error, RequestError::Timeout(Duration::from_millis(200)));

        // Completing the survivor afterwards must not flip the result.
        second.complete(pong_envelope(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            command.peek().unwrap().unwrap_err(),
            RequestError::Timeout(Duration::from_millis(200))
        );
    }

    #[tokio::test]
    async fn test_command_future_abort() {
        let command = CommandFuture::new();
        let pending = MessageFuture::new();
        command.add(ResponseFuture::<Pong>::new(pending.clone()), |_| {});

        command.abort();
        assert_eq!(command.wait().await.unwrap_err(), RequestError::Aborted);
    }

    #[test]
    fn test_ping_payload_symmetry() {
        // Request payloads extract too, for handlers that want typed input.
        let payload: Payload = Ping.into();
        assert!(Ping::try_from(payload).is_ok());
    }
}
