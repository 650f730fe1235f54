// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Bayeux session: handshake, the `/meta/connect` heartbeat, id-correlated
//! request/response, and subscriptions that survive reconnects.
//!
//! `Session` does not subclass [`Socket`]; it owns one and supplies the
//! [`Hooks`](crate::socket::Hooks) that give the generic reconnect/queue machinery its Bayeux
//! meaning. All mutable session state lives behind one `Mutex` with short, non-`.await`-holding
//! critical sections, per the alternative concurrency model the socket layer itself allows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use finito::ExponentialBackoff;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::message::{
    Advice, ConnectRequest, DisconnectRequest, Frame, HandshakeRequest, InboundFields, ReconnectAdvice,
    ResponseError, SubscribeRequest, UnsubscribeRequest,
};
use crate::reachability::Reachability;
use crate::socket::{BoxFuture, Hooks, Socket, SocketBuilder, SocketError};
use crate::transport::{Connection, Transport, TransportError};

const LOG_TARGET: &str = "bayeux_client::session";

/// Default floor for how long [`Session::close`] waits for a `/meta/disconnect` acknowledgment
/// before closing the transport unconditionally.
const MIN_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors surfaced to a [`Session`] caller.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// The session is closed (or was never connected) and cannot service the request.
    #[error("the session is closed")]
    Closed,
    /// The server rejected the request.
    #[error(transparent)]
    Response(#[from] ResponseError),
    /// A request was dropped before a response arrived, typically because the connection was
    /// lost mid-flight.
    #[error("no response was received before the connection was lost")]
    Dropped,
    /// The outbound payload could not be encoded as JSON.
    #[error("failed to encode the outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SocketError> for SessionError {
    fn from(_: SocketError) -> Self {
        SessionError::Closed
    }
}

type SubscriptionHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct SessionState {
    client_id: Option<String>,
    advice: Advice,
    id_counter: u64,
    has_connected_before: bool,
    response_handlers: HashMap<u64, oneshot::Sender<Result<Value, ResponseError>>>,
    subscriptions: HashMap<String, SubscriptionHandler>,
}

impl SessionState {
    fn next_id(&mut self) -> u64 {
        self.id_counter += 1;
        self.id_counter
    }
}

/// A live (or reconnecting) Bayeux session.
pub struct Session<Tr: Transport> {
    socket: Socket<Tr>,
    state: Arc<Mutex<SessionState>>,
}

impl<Tr: Transport> Clone for Session<Tr> {
    fn clone(&self) -> Self {
        Session { socket: self.socket.clone(), state: self.state.clone() }
    }
}

/// A handle to an active channel subscription.
///
/// Dropping this handle does **not** unsubscribe; call [`Subscription::unsubscribe`]
/// explicitly. The session keeps its own record of subscribed channels (to resubscribe after a
/// reconnect) independent of how many `Subscription` handles a caller keeps around.
pub struct Subscription<Tr: Transport> {
    session: Session<Tr>,
    channel: String,
}

impl<Tr: Transport> Subscription<Tr> {
    /// The channel this subscription is for.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Unsubscribe from this channel.
    pub async fn unsubscribe(self) -> Result<(), SessionError> {
        self.session.unsubscribe(&self.channel).await
    }
}

/// Builds a [`Session`].
pub struct SessionBuilder<Tr: Transport, P = ExponentialBackoff> {
    inner: SocketBuilder<Tr, P>,
}

impl<Tr: Transport> SessionBuilder<Tr, ExponentialBackoff> {
    /// Start building a session that will dial `uri` through `transport`.
    pub fn new(uri: impl Into<String>, transport: Tr) -> Self {
        SessionBuilder { inner: SocketBuilder::new(uri, transport) }
    }
}

impl<Tr: Transport, P> SessionBuilder<Tr, P>
where
    P: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
{
    /// Override the reachability oracle gating connect attempts.
    pub fn reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.inner = self.inner.reachability(reachability);
        self
    }

    /// Override the retry/backoff policy used between connect attempts.
    pub fn retry_policy<P2>(self, retry_policy: P2) -> SessionBuilder<Tr, P2>
    where
        P2: Iterator<Item = Duration> + Clone + Send + Sync + 'static,
    {
        SessionBuilder { inner: self.inner.retry_policy(retry_policy) }
    }

    /// Cap how many frames may sit in the outbound queue at once.
    pub fn max_queue_depth(self, depth: usize) -> Self {
        SessionBuilder { inner: self.inner.max_queue_depth(depth) }
    }

    /// Finish building the session. The underlying socket's driver task is spawned immediately,
    /// but no connection is attempted until [`Session::connect`] is called.
    pub fn build(self) -> Session<Tr> {
        let state = Arc::new(Mutex::new(SessionState {
            client_id: None,
            advice: Advice::default(),
            id_counter: 0,
            has_connected_before: false,
            response_handlers: HashMap::new(),
            subscriptions: HashMap::new(),
        }));

        let socket_cell: Arc<OnceLock<Socket<Tr>>> = Arc::new(OnceLock::new());

        let hooks = {
            let state = state.clone();
            let on_connected_state = state.clone();
            let on_connected_socket = socket_cell.clone();
            let on_message_state = state.clone();
            let on_message_socket = socket_cell.clone();
            let should_reconnect_state = state.clone();
            let serialize_state = state.clone();
            Hooks {
                on_connected: Box::new(move |conn: &mut Tr::Connection| {
                    let state = on_connected_state.clone();
                    let socket = on_connected_socket.clone();
                    Box::pin(async move { run_connected_hook(conn, &state, &socket).await })
                        as BoxFuture<'_, Result<(), String>>
                }),
                on_message: Box::new(move |text: String| {
                    dispatch_frame(&on_message_state, &on_message_socket, text);
                }),
                on_closed: Box::new(move |err: Option<&TransportError>| {
                    if let Some(err) = err {
                        tracing::debug!(target: LOG_TARGET, %err, "session connection dropped");
                    } else {
                        tracing::debug!(target: LOG_TARGET, "session connection closed");
                    }
                }),
                should_reconnect: Box::new(move || {
                    should_reconnect_state.lock().expect("session state mutex poisoned").advice.reconnect
                        != ReconnectAdvice::None
                }),
                serialize: Box::new(move |frame: &Frame| {
                    let client_id = serialize_state.lock().expect("session state mutex poisoned").client_id.clone();
                    frame.to_wire_text(client_id.as_deref())
                }),
            }
        };

        let socket = self.inner.build_with_hooks(hooks);
        let _ = socket_cell.set(socket.clone());

        Session { socket, state }
    }
}

impl<Tr: Transport> Session<Tr> {
    /// Build a session with default reachability (always considered up) and backoff policy.
    pub fn builder(uri: impl Into<String>, transport: Tr) -> SessionBuilder<Tr, ExponentialBackoff> {
        SessionBuilder::new(uri, transport)
    }

    /// Connect (handshaking if necessary), resolving once the session has a `clientId`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.socket.connect().await?;
        Ok(())
    }

    /// True if the session currently has a live, handshaken connection.
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// How many times the underlying transport has reconnected.
    pub fn reconnect_count(&self) -> u64 {
        self.socket.reconnect_count()
    }

    /// The current `clientId`, if the session has ever completed a handshake.
    pub fn client_id(&self) -> Option<String> {
        self.state.lock().expect("session state mutex poisoned").client_id.clone()
    }

    /// Publish `data` to `channel` without waiting for an acknowledgment.
    pub fn publish(&self, channel: impl Into<String>, data: impl Serialize) -> Result<(), SessionError> {
        let id = self.state.lock().expect("session state mutex poisoned").next_id();
        let frame = Frame::new(id, channel, DataBody { data })?;
        self.socket.send(frame);
        Ok(())
    }

    /// Send a message and wait for the server's response.
    pub async fn send_async(&self, channel: impl Into<String>, body: impl Serialize) -> Result<Value, SessionError> {
        let channel = channel.into();
        let (id, rx) = {
            let mut state = self.state.lock().expect("session state mutex poisoned");
            let id = state.next_id();
            let (tx, rx) = oneshot::channel();
            state.response_handlers.insert(id, tx);
            (id, rx)
        };
        let frame = Frame::new(id, channel, body)?;
        self.socket.send(frame);
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(response_error)) => Err(SessionError::Response(response_error)),
            Err(_) => Err(SessionError::Dropped),
        }
    }

    /// Subscribe to `channel`, invoking `handler` for every message delivered to it.
    ///
    /// The subscription is re-issued automatically after every reconnect; `handler` lives for
    /// as long as the returned [`Subscription`] is not unsubscribed, independent of how the
    /// underlying connection cycles.
    pub async fn subscribe<F>(&self, channel: impl Into<String>, handler: F) -> Result<Subscription<Tr>, SessionError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let channel = channel.into();
        {
            let mut state = self.state.lock().expect("session state mutex poisoned");
            // Delivery messages are `{channel, data, ...}`; the handler only ever sees the
            // payload, never the envelope it arrived in.
            state
                .subscriptions
                .insert(channel.clone(), Arc::new(move |raw: Value| handler(raw.get("data").cloned().unwrap_or(Value::Null))));
        }
        let result = self
            .send_async("/meta/subscribe", SubscribeRequest { subscription: channel.clone() })
            .await;
        if let Err(err) = result {
            self.state.lock().expect("session state mutex poisoned").subscriptions.remove(&channel);
            return Err(err);
        }
        Ok(Subscription { session: self.clone(), channel })
    }

    /// Unsubscribe from `channel`.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), SessionError> {
        self.state.lock().expect("session state mutex poisoned").subscriptions.remove(channel);
        self.send_async("/meta/unsubscribe", UnsubscribeRequest { subscription: channel.to_owned() })
            .await
            .map(|_| ())
    }

    /// Disconnect: clears all subscriptions, sends `/meta/disconnect` and waits for its
    /// acknowledgment, racing against a timeout derived from the last-seen `advice.interval`
    /// (floored at one second), then closes the underlying transport unconditionally either way.
    pub async fn close(&self) {
        let timeout = {
            let mut state = self.state.lock().expect("session state mutex poisoned");
            state.subscriptions.clear();
            Duration::from_millis(state.advice.interval).max(MIN_DISCONNECT_TIMEOUT)
        };
        let ack = self.send_async("/meta/disconnect", DisconnectRequest::default());
        let _ = tokio::time::timeout(timeout, ack).await;
        self.socket.close(1000, "disconnect".to_owned()).await;
    }
}

#[derive(Serialize)]
struct DataBody<T: Serialize> {
    data: T,
}

async fn run_connected_hook<Tr: Transport>(
    conn: &mut Tr::Connection,
    state: &Arc<Mutex<SessionState>>,
    socket: &Arc<OnceLock<Socket<Tr>>>,
) -> Result<(), String> {
    // The Bayeux clientId dies at every pre-handshake moment, and every reconnect — whether
    // advice said `retry` or `handshake` — follows the same re-handshake path on this client;
    // the two advice values are not distinguished here, only in whether auto-reconnect happens
    // at all (see `should_reconnect`).
    state.lock().expect("session state mutex poisoned").client_id = None;

    let id = state.lock().expect("session state mutex poisoned").next_id();
    let frame = Frame::new(id, "/meta/handshake", HandshakeRequest::default()).map_err(|e| e.to_string())?;
    conn.send(frame.to_wire_text(None)).await.map_err(|e| e.to_string())?;

    let response = read_until(conn, |fields| fields.channel == "/meta/handshake").await?;
    if response.successful != Some(true) {
        return Err(response.error.unwrap_or_else(|| "handshake rejected".to_owned()));
    }
    {
        let mut state = state.lock().expect("session state mutex poisoned");
        state.client_id = response.client_id.clone();
        if let Some(advice) = response.advice {
            state.advice = advice;
        }
    }

    let (is_reconnect, channels) = {
        let mut state = state.lock().expect("session state mutex poisoned");
        let is_reconnect = state.has_connected_before;
        state.has_connected_before = true;
        let channels = if is_reconnect { state.subscriptions.keys().cloned().collect() } else { Vec::new() };
        (is_reconnect, channels)
    };

    // Subscriptions are re-issued by enqueuing onto the socket's normal queue rather than
    // writing `conn` directly: by the time the driver flushes it, `client_id` above is already
    // current, so the generic `serialize` hook stamps these correctly without this function
    // needing write access to the connection at all.
    if let Some(socket) = socket.get() {
        if is_reconnect {
            for channel in channels {
                let id = state.lock().expect("session state mutex poisoned").next_id();
                match Frame::new(id, "/meta/subscribe", SubscribeRequest { subscription: channel.clone() }) {
                    Ok(frame) => socket.send(frame),
                    Err(err) => {
                        tracing::warn!(target: LOG_TARGET, %err, %channel, "failed to build resubscribe frame")
                    }
                }
            }
        }

        // Kick off the heartbeat: the long-poll-style `/meta/connect` loop is driven entirely
        // by each response scheduling the next request (see `schedule_next_connect`), so
        // nothing advances it until the first one is sent here.
        let id = state.lock().expect("session state mutex poisoned").next_id();
        match Frame::new(id, "/meta/connect", ConnectRequest::default()) {
            Ok(frame) => socket.send(frame),
            Err(err) => tracing::warn!(target: LOG_TARGET, %err, "failed to build the initial /meta/connect frame"),
        }
    }

    Ok(())
}

/// Read frames from `conn` until one matches `predicate`, discarding anything else (there
/// should be nothing else to discard before a handshake response, but a permissive read loop
/// costs nothing and survives a server that gets chatty early).
async fn read_until<C, Pred>(conn: &mut C, predicate: Pred) -> Result<InboundFields, String>
where
    C: Connection,
    Pred: Fn(&InboundFields) -> bool,
{
    loop {
        let text = conn
            .recv()
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "connection closed before a response arrived".to_owned())?;
        for item in parse_frames(&text) {
            if predicate(&item.0) {
                return Ok(item.0);
            }
        }
    }
}

fn parse_frames(text: &str) -> Vec<(InboundFields, Value)> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text) else {
        tracing::warn!(target: LOG_TARGET, "discarding a frame that was not a JSON array");
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<InboundFields>(item.clone()) {
            Ok(fields) => Some((fields, item)),
            Err(err) => {
                tracing::warn!(target: LOG_TARGET, %err, "discarding an unparsable message");
                None
            }
        })
        .collect()
}

fn dispatch_frame<Tr: Transport>(state: &Arc<Mutex<SessionState>>, socket: &Arc<OnceLock<Socket<Tr>>>, text: String) {
    for (fields, raw) in parse_frames(&text) {
        dispatch_one(state, socket, fields, raw);
    }
}

fn dispatch_one<Tr: Transport>(
    state: &Arc<Mutex<SessionState>>,
    socket: &Arc<OnceLock<Socket<Tr>>>,
    fields: InboundFields,
    raw: Value,
) {
    if let Some(advice) = fields.advice {
        state.lock().expect("session state mutex poisoned").advice = advice;
    }

    if let Some(id) = fields.id.as_deref().and_then(|s| s.parse::<u64>().ok()) {
        let handler = state.lock().expect("session state mutex poisoned").response_handlers.remove(&id);
        if let Some(handler) = handler {
            let result = if fields.successful.unwrap_or(true) {
                Ok(raw)
            } else {
                Err(fields.error.map(|e| ResponseError::parse(&e)).unwrap_or(ResponseError {
                    code: 0,
                    args: Vec::new(),
                    description: "the server reported an unsuccessful response".to_owned(),
                }))
            };
            let _ = handler.send(result);
            return;
        }
    }

    if fields.channel == "/meta/connect" {
        let reconnect = state.lock().expect("session state mutex poisoned").advice.reconnect;
        if reconnect == ReconnectAdvice::Retry {
            schedule_next_connect(state, socket);
        }
        return;
    }

    let handler = state.lock().expect("session state mutex poisoned").subscriptions.get(&fields.channel).cloned();
    if let Some(handler) = handler {
        // A panicking subscription handler must not take the driver task (and with it every
        // other subscription and the reconnect loop) down with it.
        let channel = fields.channel.clone();
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(raw))) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic payload>".to_owned());
            tracing::warn!(target: LOG_TARGET, %channel, %message, "subscription handler panicked; dropping the message");
        }
    }
}

fn schedule_next_connect<Tr: Transport>(state: &Arc<Mutex<SessionState>>, socket: &Arc<OnceLock<Socket<Tr>>>) {
    let Some(socket) = socket.get().cloned() else { return };
    let (id, interval) = {
        let mut state = state.lock().expect("session state mutex poisoned");
        (state.next_id(), state.advice.interval)
    };
    tokio::spawn(async move {
        if interval > 0 {
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
        if !socket.is_connected() {
            return;
        }
        match Frame::new(id, "/meta/connect", ConnectRequest::default()) {
            Ok(frame) => socket.send(frame),
            Err(err) => tracing::warn!(target: LOG_TARGET, %err, "failed to build the next /meta/connect frame"),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::mock::{MockTransport, ServerHandle};
    use crate::transport::TransportFuture;

    /// `MockTransport` is usually owned outright by a `Socket`; these tests keep a second
    /// handle around to drive the server side, so the transport itself is shared through this
    /// thin wrapper.
    struct SharedMockTransport(Arc<MockTransport>);

    impl Transport for SharedMockTransport {
        type Connection = crate::mock::MockConnection;
        fn connect<'a>(&'a self, uri: &'a str) -> TransportFuture<'a, Self::Connection> {
            self.0.connect(uri)
        }
    }

    /// Read one client frame from `server` and reply to its `/meta/handshake` with a fresh
    /// `clientId`, defaulting to a `Retry` advice with no delay.
    async fn respond_to_handshake(server: &mut ServerHandle, client_id: &str) {
        let request = server.recv().await.expect("client should have sent a handshake");
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/handshake");
        server.send(
            json!([{
                "channel": "/meta/handshake",
                "successful": true,
                "clientId": client_id,
                "id": parsed[0]["id"].clone(),
                "advice": {"reconnect": "retry", "interval": 0},
            }])
            .to_string(),
        );
    }

    /// Read the `/meta/connect` frame the session sends right after a successful handshake to
    /// kick off its heartbeat loop, and discard it without replying (nothing in these tests
    /// waits on it: it isn't a `send_async`-correlated request).
    async fn drain_initial_connect(server: &mut ServerHandle) {
        let request = server.recv().await.expect("client should send the initial /meta/connect heartbeat");
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/connect");
    }

    async fn connected_session() -> (Session<SharedMockTransport>, ServerHandle) {
        let transport = Arc::new(MockTransport::new());
        transport.push_connect_success();
        let session = Session::builder("ws://example.invalid", SharedMockTransport(transport.clone())).build();

        // `connect()` only resolves once the handshake itself succeeds, so it has to run
        // alongside -- not before -- the scripted handshake exchange below.
        let session_clone = session.clone();
        let connect = tokio::spawn(async move { session_clone.connect().await });

        let mut server = transport.next_server().await;
        respond_to_handshake(&mut server, "client-1").await;
        drain_initial_connect(&mut server).await;

        connect.await.unwrap().unwrap();
        assert_eq!(session.client_id().as_deref(), Some("client-1"));
        (session, server)
    }

    #[tokio::test]
    async fn handshake_populates_client_id() {
        let (session, _server) = connected_session().await;
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn rejected_handshake_is_retried_rather_than_surfaced() {
        let transport = Arc::new(MockTransport::new());
        transport.push_connect_success();
        transport.push_connect_success();
        let session = Session::builder("ws://example.invalid", SharedMockTransport(transport.clone())).build();

        // `connect()` only resolves once a handshake actually succeeds, so it has to run
        // alongside the scripted exchange below rather than be awaited up front.
        let session_clone = session.clone();
        let connect = tokio::spawn(async move { session_clone.connect().await });

        let mut server = transport.next_server().await;
        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        server.send(
            json!([{
                "channel": "/meta/handshake",
                "successful": false,
                "error": "402::Unknown client",
                "id": parsed[0]["id"].clone(),
            }])
            .to_string(),
        );

        // The rejected handshake should cause a retry against the second scripted connect,
        // with no error surfaced anywhere -- `connect()` just keeps waiting.
        let mut second = transport.next_server().await;
        respond_to_handshake(&mut second, "client-2").await;

        connect.await.unwrap().unwrap();
        assert_eq!(session.client_id().as_deref(), Some("client-2"));
    }

    #[tokio::test]
    async fn send_async_correlates_responses_by_id() {
        let (session, mut server) = connected_session().await;

        let send = tokio::spawn(async move { session.send_async("/some/channel", json!({"hello": "world"})).await });

        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/some/channel");
        assert_eq!(parsed[0]["data"]["hello"], "world");
        assert_eq!(parsed[0]["clientId"], "client-1");

        server.send(
            json!([{
                "channel": "/some/channel",
                "successful": true,
                "id": parsed[0]["id"].clone(),
                "data": {"ack": true},
            }])
            .to_string(),
        );

        let response = send.await.unwrap().unwrap();
        assert_eq!(response["data"]["ack"], true);
    }

    #[tokio::test]
    async fn send_async_surfaces_server_errors() {
        let (session, mut server) = connected_session().await;

        let send = tokio::spawn(async move { session.send_async("/some/channel", json!({})).await });

        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        server.send(
            json!([{
                "channel": "/some/channel",
                "successful": false,
                "error": "403:channel:Forbidden",
                "id": parsed[0]["id"].clone(),
            }])
            .to_string(),
        );

        match send.await.unwrap() {
            Err(SessionError::Response(err)) => {
                assert_eq!(err.code, 403);
                assert_eq!(err.description, "Forbidden");
            }
            other => panic!("expected a Response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_messages_to_its_handler() {
        let (session, mut server) = connected_session().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let session_clone = session.clone();
        let subscribe = tokio::spawn(async move {
            session_clone
                .subscribe("/foo/bar", move |data| {
                    received_clone.lock().unwrap().push(data);
                })
                .await
        });

        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/subscribe");
        assert_eq!(parsed[0]["subscription"], "/foo/bar");
        server.send(
            json!([{
                "channel": "/meta/subscribe",
                "successful": true,
                "subscription": "/foo/bar",
                "id": parsed[0]["id"].clone(),
            }])
            .to_string(),
        );

        let subscription = subscribe.await.unwrap().unwrap();
        assert_eq!(subscription.channel(), "/foo/bar");

        server.send(json!([{"channel": "/foo/bar", "data": {"value": 42}}]).to_string());
        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.lock().unwrap()[0]["value"], 42);

        let unsubscribe = tokio::spawn(async move { subscription.unsubscribe().await });
        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/unsubscribe");
        server.send(
            json!([{"channel": "/meta/unsubscribe", "successful": true, "id": parsed[0]["id"].clone()}]).to_string(),
        );
        unsubscribe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_take_down_the_dispatch_loop() {
        let (session, mut server) = connected_session().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let session_clone = session.clone();
        let subscribe = tokio::spawn(async move {
            session_clone
                .subscribe("/foo/bar", move |data| {
                    if data["boom"].as_bool() == Some(true) {
                        panic!("handler exploded on purpose");
                    }
                    received_clone.lock().unwrap().push(data);
                })
                .await
        });

        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        server.send(
            json!([{"channel": "/meta/subscribe", "successful": true, "id": parsed[0]["id"].clone()}]).to_string(),
        );
        subscribe.await.unwrap().unwrap();

        server.send(json!([{"channel": "/foo/bar", "data": {"boom": true}}]).to_string());
        server.send(json!([{"channel": "/foo/bar", "data": {"value": 7}}]).to_string());

        for _ in 0..50 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.lock().unwrap().as_slice(), [json!({"value": 7})]);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn resubscribes_after_a_reconnect() {
        let transport = Arc::new(MockTransport::new());
        transport.push_connect_success();
        transport.push_connect_success();
        let session = Session::builder("ws://example.invalid", SharedMockTransport(transport.clone())).build();

        let session_clone = session.clone();
        let connect = tokio::spawn(async move { session_clone.connect().await });

        let mut first = transport.next_server().await;
        respond_to_handshake(&mut first, "client-1").await;
        drain_initial_connect(&mut first).await;
        connect.await.unwrap().unwrap();

        let session_clone = session.clone();
        let subscribe = tokio::spawn(async move { session_clone.subscribe("/foo/bar", |_| {}).await });
        let request = first.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        first.send(
            json!([{"channel": "/meta/subscribe", "successful": true, "id": parsed[0]["id"].clone()}]).to_string(),
        );
        subscribe.await.unwrap().unwrap();

        // Drop the connection; the session should reconnect, re-handshake (same clientId
        // advice) and push a fresh /meta/subscribe for the channel it still has a handler for.
        first.hang_up();

        let mut second = transport.next_server().await;
        respond_to_handshake(&mut second, "client-1").await;

        let request = second.recv().await.expect("a resubscribe frame should follow the second handshake");
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/subscribe");
        assert_eq!(parsed[0]["subscription"], "/foo/bar");
    }

    #[tokio::test]
    async fn close_races_disconnect_ack_against_timeout_then_closes_the_socket() {
        let (session, mut server) = connected_session().await;

        let close = tokio::spawn(async move { session.close().await });
        let request = server.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(parsed[0]["channel"], "/meta/disconnect");
        server.send(
            json!([{"channel": "/meta/disconnect", "successful": true, "id": parsed[0]["id"].clone()}]).to_string(),
        );
        close.await.unwrap();
    }
}
