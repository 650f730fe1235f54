// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A reconnecting WebSocket socket: the Bayeux-agnostic half of this crate.
//!
//! [`Socket`] owns a single [`Transport`] connection at a time, retries connects with
//! backoff gated on a [`Reachability`] oracle, and queues [`Frame`]s while disconnected so
//! they flush in order once a connection is (re-)established. Everything Bayeux-specific
//! (handshake, advice, subscriptions) is layered on top by [`crate::session::Session`] via the
//! [`Hooks`] it installs at construction time, rather than by subclassing: `Session` owns a
//! `Socket` and supplies callbacks instead of overriding its methods.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use finito::ExponentialBackoff;
use tokio::sync::{watch, Notify};

use crate::message::Frame;
use crate::reachability::{AlwaysOnline, Reachability};
use crate::retry::auto_retry;
use crate::transport::{Connection, Transport, TransportError};

const LOG_TARGET: &str = "bayeux_client::socket";

/// A boxed future returned from a [`Hooks`] callback.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors a [`Socket`] can report back to its owner.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SocketError {
    /// The socket was closed (by [`Socket::close`] or because its last handle was dropped)
    /// before the operation could complete.
    #[error("the socket is closed")]
    Closed,
}

/// Hooks a [`Socket`] owner installs to layer its own semantics onto the raw reconnect/queue/
/// flush mechanics. All callbacks run on the socket's single driver task, so they never race
/// each other or the public [`Socket`] methods that touch shared state through that same task.
pub(crate) struct Hooks<Tr: Transport> {
    /// Invoked with exclusive write/read access to a freshly connected connection, before the
    /// socket is marked connected or any queued frames are flushed. Used to perform a
    /// handshake out of band from the generic frame queue. Returning `Err` aborts this
    /// connect attempt (the connection is closed and the connect loop retries).
    pub on_connected: Box<dyn for<'a> Fn(&'a mut Tr::Connection) -> BoxFuture<'a, Result<(), String>> + Send + Sync>,
    /// Invoked for every inbound text frame once the socket is connected.
    pub on_message: Box<dyn Fn(String) + Send + Sync>,
    /// Invoked whenever the connection drops, successfully or not.
    pub on_closed: Box<dyn Fn(Option<&TransportError>) + Send + Sync>,
    /// Whether the socket should attempt to reconnect after the current drop. Consulted once
    /// per drop; returning `false` parks the driver until [`Socket::connect`] is called again.
    pub should_reconnect: Box<dyn Fn() -> bool + Send + Sync>,
    /// Turns a queued [`Frame`] into wire text. Called at flush time, not at queue time, so
    /// whatever state the hook closes over (e.g. the current `clientId`) reflects the
    /// connection the frame is actually being sent on.
    pub serialize: Box<dyn Fn(&Frame) -> String + Send + Sync>,
}

struct State {
    queue: std::collections::VecDeque<Frame>,
}

struct Inner<Tr: Transport> {
    uri: String,
    transport: Tr,
    reachability: Arc<dyn Reachability>,
    hooks: Hooks<Tr>,
    state: Mutex<State>,
    flush_notify: Notify,
    want_connected: Notify,
    connected_tx: watch::Sender<bool>,
    ever_connected: AtomicBool,
    reconnect_count: std::sync::atomic::AtomicU64,
    closed: AtomicBool,
    pending_close: Mutex<Option<(u16, String)>>,
    /// Flips to `true` once the driver task has torn down the transport and exited for good,
    /// so [`Socket::close`] can wait for the real `closed` event rather than returning as soon
    /// as it has asked for a shutdown.
    driver_exited_tx: watch::Sender<bool>,
}

/// A reconnecting WebSocket socket.
///
/// Cloning a `Socket` is cheap and shares the same underlying connection and queue; the last
/// clone being dropped does not by itself close the socket (call [`Socket::close`]
/// explicitly, or let the whole process exit).
pub struct Socket<Tr: Transport> {
    inner: Arc<Inner<Tr>>,
}

impl<Tr: Transport> Clone for Socket<Tr> {
    fn clone(&self) -> Self {
        Socket { inner: self.inner.clone() }
    }
}

/// Builds a [`Socket`].
pub struct SocketBuilder<Tr: Transport, P = ExponentialBackoff> {
    uri: String,
    transport: Tr,
    reachability: Arc<dyn Reachability>,
    retry_policy: P,
    max_queue_depth: usize,
}

impl<Tr: Transport> SocketBuilder<Tr, ExponentialBackoff> {
    /// Start building a socket that will dial `uri` through `transport`.
    ///
    /// Defaults to an unbounded queue depth, an always-reachable oracle, and `finito`'s
    /// exponential backoff starting at 50ms.
    pub fn new(uri: impl Into<String>, transport: Tr) -> Self {
        SocketBuilder {
            uri: uri.into(),
            transport,
            reachability: Arc::new(AlwaysOnline::default()),
            retry_policy: ExponentialBackoff::from_millis(50),
            max_queue_depth: usize::MAX,
        }
    }
}

impl<Tr: Transport, P> SocketBuilder<Tr, P>
where
    P: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
{
    /// Override the reachability oracle gating connect attempts.
    pub fn reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    /// Override the retry/backoff policy used between connect attempts.
    pub fn retry_policy<P2>(self, retry_policy: P2) -> SocketBuilder<Tr, P2>
    where
        P2: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
    {
        SocketBuilder {
            uri: self.uri,
            transport: self.transport,
            reachability: self.reachability,
            retry_policy,
            max_queue_depth: self.max_queue_depth,
        }
    }

    /// Cap how many frames may sit in the outbound queue at once. Enqueuing past this depth
    /// drops the oldest unsent frame and logs a warning rather than growing without bound.
    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub(crate) fn build_with_hooks(self, hooks: Hooks<Tr>) -> Socket<Tr> {
        let (connected_tx, _connected_rx) = watch::channel(false);
        let (driver_exited_tx, _driver_exited_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            uri: self.uri,
            transport: self.transport,
            reachability: self.reachability,
            hooks,
            state: Mutex::new(State { queue: std::collections::VecDeque::new() }),
            flush_notify: Notify::new(),
            want_connected: Notify::new(),
            connected_tx,
            ever_connected: AtomicBool::new(false),
            reconnect_count: std::sync::atomic::AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending_close: Mutex::new(None),
            driver_exited_tx,
        });

        let driver_inner = inner.clone();
        let policy = self.retry_policy;
        let max_queue_depth = self.max_queue_depth;
        tokio::spawn(async move {
            driver_loop(driver_inner.clone(), policy, max_queue_depth).await;
            let _ = driver_inner.driver_exited_tx.send(true);
        });

        Socket { inner }
    }
}

impl<Tr: Transport> Socket<Tr> {
    /// Ask the socket to be connected, resolving once it is (or immediately, if it already
    /// is). Multiple concurrent callers all resolve off the same underlying attempt; only the
    /// driver task ever calls [`Transport::connect`].
    pub async fn connect(&self) -> Result<(), SocketError> {
        if *self.inner.connected_tx.borrow() {
            return Ok(());
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        let mut rx = self.inner.connected_tx.subscribe();
        self.inner.want_connected.notify_one();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SocketError::Closed);
            }
            if rx.changed().await.is_err() {
                return Err(SocketError::Closed);
            }
        }
    }

    /// Queue a frame for delivery, flushing immediately if currently connected.
    pub fn send(&self, frame: Frame) {
        let mut state = self.inner.state.lock().expect("socket state mutex poisoned");
        state.queue.push_back(frame);
        drop(state);
        self.inner.flush_notify.notify_one();
    }

    /// True if the socket currently has a live connection.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// How many times the socket has successfully reconnected after its initial connect.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }

    /// Permanently close the socket: the current connection (if any) is closed with `code`/
    /// `reason` and all queued frames are dropped. Resolves only once the driver task has
    /// actually torn the transport down and exited, matching the "returns only after `closed`
    /// has fired" contract of the source this crate is modeled on.
    pub async fn close(&self, code: u16, reason: String) {
        self.inner.closed.store(true, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().expect("socket state mutex poisoned");
            state.queue.clear();
        }
        self.inner.pending_close.lock().expect("socket state mutex poisoned").replace((code, reason));
        let _ = self.inner.connected_tx.send(false);
        self.inner.want_connected.notify_one();
        self.inner.flush_notify.notify_one();

        if *self.inner.driver_exited_tx.borrow() {
            return;
        }
        let mut rx = self.inner.driver_exited_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

enum DriveOutcome {
    Closed(Option<TransportError>),
    ClosedByOwner,
}

async fn driver_loop<Tr, P>(inner: Arc<Inner<Tr>>, base_policy: P, max_queue_depth: usize)
where
    Tr: Transport,
    P: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
{
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.want_connected.notified().await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let was_reconnect = inner.ever_connected.load(Ordering::SeqCst);

        let connect_once = || async { inner.transport.connect(&inner.uri).await };
        let Ok(mut conn) = auto_retry(inner.reachability.as_ref(), usize::MAX, base_policy.clone(), connect_once).await
        else {
            unreachable!("auto_retry with usize::MAX attempts never returns Err")
        };

        let handshake_result = (inner.hooks.on_connected)(&mut conn).await;
        if let Err(reason) = handshake_result {
            tracing::debug!(target: LOG_TARGET, %reason, "connect hook rejected the new connection");
            let _ = conn.close(1011, "rejected").await;
            (inner.hooks.on_closed)(None);
            if inner.closed.load(Ordering::SeqCst) || !(inner.hooks.should_reconnect)() {
                continue;
            }
            inner.want_connected.notify_one();
            continue;
        }

        inner.ever_connected.store(true, Ordering::SeqCst);
        let _ = inner.connected_tx.send(true);
        flush(&inner, &mut conn, max_queue_depth).await;

        let outcome = drive_connected(&inner, &mut conn, max_queue_depth).await;

        let _ = inner.connected_tx.send(false);
        match outcome {
            DriveOutcome::ClosedByOwner => {
                let (code, reason) = inner.pending_close.lock().expect("mutex poisoned").take().unwrap_or((1000, "going away".to_owned()));
                let _ = conn.close(code, &reason).await;
                return;
            }
            DriveOutcome::Closed(err) => {
                (inner.hooks.on_closed)(err.as_ref());
                if was_reconnect {
                    inner.reconnect_count.fetch_add(1, Ordering::SeqCst);
                }
                if inner.closed.load(Ordering::SeqCst) || !(inner.hooks.should_reconnect)() {
                    continue;
                }
                inner.want_connected.notify_one();
            }
        }
    }
}

async fn drive_connected<Tr: Transport>(
    inner: &Arc<Inner<Tr>>,
    conn: &mut Tr::Connection,
    max_queue_depth: usize,
) -> DriveOutcome {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return DriveOutcome::ClosedByOwner;
        }
        tokio::select! {
            biased;
            _ = inner.reachability.await_down() => {
                let _ = conn.close(1002, "network unreachable").await;
                return DriveOutcome::Closed(None);
            }
            message = conn.recv() => {
                match message {
                    Ok(Some(text)) => (inner.hooks.on_message)(text),
                    Ok(None) => return DriveOutcome::Closed(None),
                    Err(err) => return DriveOutcome::Closed(Some(err)),
                }
            }
            _ = inner.flush_notify.notified() => {
                if !flush(inner, conn, max_queue_depth).await {
                    return DriveOutcome::Closed(None);
                }
            }
        }
    }
}

/// Drain as much of the queue as can be sent right now. Returns `false` if a write failed
/// (the connection should be considered dead).
async fn flush<Tr: Transport>(inner: &Arc<Inner<Tr>>, conn: &mut Tr::Connection, max_queue_depth: usize) -> bool {
    loop {
        let next = {
            let mut state = inner.state.lock().expect("socket state mutex poisoned");
            while state.queue.len() > max_queue_depth {
                if let Some(dropped) = state.queue.pop_front() {
                    tracing::warn!(
                        target: LOG_TARGET,
                        channel = %dropped.channel,
                        id = dropped.id,
                        "dropping queued frame, queue exceeded max depth"
                    );
                }
            }
            state.queue.pop_front()
        };
        let Some(frame) = next else { return true };
        let text = (inner.hooks.serialize)(&frame);
        if let Err(err) = conn.send(text).await {
            tracing::debug!(target: LOG_TARGET, error = %err, "write failed while flushing queue");
            let mut state = inner.state.lock().expect("socket state mutex poisoned");
            state.queue.push_front(frame);
            return false;
        }
    }
}
