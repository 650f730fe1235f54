// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A scripted [`Transport`] for tests, in the spirit of `subxt-rpcs`'s `MockRpcClient`: rather
//! than a closure per request, each connect attempt is scripted up front and handed a paired
//! [`ServerHandle`] the test drives directly.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::transport::{Connection, Transport, TransportError, TransportFuture};

enum Outcome {
    Fail,
    Succeed,
}

/// A [`Transport`] whose connect attempts are scripted by a test, one outcome per call.
///
/// Calling [`MockTransport::connect`](Transport::connect) more times than outcomes were
/// pushed is treated as `Succeed`, so a test that only cares about the first attempt's
/// failure/success pattern doesn't need to script every reconnect too.
pub struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    handles_tx: mpsc::UnboundedSender<ServerHandle>,
    handles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerHandle>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        MockTransport {
            script: Mutex::new(VecDeque::new()),
            handles_tx,
            handles_rx: tokio::sync::Mutex::new(handles_rx),
        }
    }
}

impl MockTransport {
    /// Construct a transport with no scripted outcomes (every connect attempt succeeds).
    pub fn new() -> Self {
        Self::default()
    }

    /// The next connect attempt will fail.
    pub fn push_connect_failure(&self) {
        self.script.lock().expect("poisoned").push_back(Outcome::Fail);
    }

    /// The next connect attempt will succeed.
    pub fn push_connect_success(&self) {
        self.script.lock().expect("poisoned").push_back(Outcome::Succeed);
    }

    /// Wait for the next successful connect's server-side handle, in the order connects
    /// happened.
    pub async fn next_server(&self) -> ServerHandle {
        self.handles_rx
            .lock()
            .await
            .recv()
            .await
            .expect("MockTransport dropped before the expected connect happened")
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn connect<'a>(&'a self, _uri: &'a str) -> TransportFuture<'a, Self::Connection> {
        Box::pin(async move {
            let outcome = self.script.lock().expect("poisoned").pop_front().unwrap_or(Outcome::Succeed);
            match outcome {
                Outcome::Fail => Err(TransportError::Connect("scripted connect failure".to_owned())),
                Outcome::Succeed => {
                    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<String>();
                    let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<String>();
                    let handle = ServerHandle { to_client: to_client_tx, from_client: from_client_rx };
                    let _ = self.handles_tx.send(handle);
                    Ok(MockConnection { inbound: to_client_rx, outbound: from_client_tx })
                }
            }
        })
    }
}

/// The client-side half of a scripted connection.
pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Connection for MockConnection {
    fn send(&mut self, text: String) -> TransportFuture<'_, ()> {
        Box::pin(async move { self.outbound.send(text).map_err(|_| TransportError::ConnectionAborted) })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.inbound.recv().await) })
    }

    fn close(&mut self, _code: u16, _reason: &str) -> TransportFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }
}

/// The test-side half of a scripted connection, handed out by [`MockTransport::next_server`].
pub struct ServerHandle {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerHandle {
    /// Push one text frame to the client.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.to_client.send(text.into());
    }

    /// Wait for the next frame the client sent.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Drop the server side, which the client observes as a clean close.
    pub fn hang_up(self) {
        drop(self.to_client);
    }
}
