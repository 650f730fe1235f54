// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The [`Transport`] contract: what [`crate::socket::Socket`] needs from a WebSocket
//! connection, abstracted away from any particular WebSocket crate.
//!
//! The trait is deliberately narrow and uses hand-written boxed futures rather than
//! `async-trait`, the same way `subxt`'s `RpcClientT` does: it keeps the vtable small and
//! avoids an extra proc-macro dependency for a trait with only three methods.

use std::future::Future;
use std::pin::Pin;

/// A boxed future returned from a [`Transport`] or [`Connection`] method.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors a [`Transport`] implementation can report.
///
/// This is intentionally flatter than, say, `tungstenite::Error`: callers only ever need to
/// distinguish "the peer closed the connection" (reconnect silently) from everything else
/// (reconnect, but it's worth logging).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connect attempt itself failed (DNS, TCP refused, TLS handshake, HTTP upgrade
    /// rejected, ...).
    #[error("connect failed: {0}")]
    Connect(String),
    /// The peer closed the connection, or the underlying stream reported EOF/reset.
    #[error("connection aborted")]
    ConnectionAborted,
    /// A write to an established connection failed.
    #[error("write failed: {0}")]
    Write(String),
    /// A read from an established connection failed for a reason other than the peer closing
    /// it normally.
    #[error("read failed: {0}")]
    Read(String),
}

impl TransportError {
    /// True for the subset of errors that represent an ordinary, expected disconnect rather
    /// than something worth surfacing to a human.
    pub fn is_connection_aborted(&self) -> bool {
        matches!(self, TransportError::ConnectionAborted)
    }
}

/// A single, live WebSocket connection.
///
/// A `Connection` is used by exactly one task at a time: [`Socket`](crate::socket::Socket)'s
/// driver loop owns it outright for its whole lifetime and never shares it, so implementations
/// do not need to be `Sync`.
pub trait Connection: Send + 'static {
    /// Send one text frame. Resolves once the frame has been handed to the underlying socket;
    /// it does not wait for the peer to acknowledge anything (Bayeux has no transport-level
    /// ack), so ordering, not delivery, is the only guarantee.
    fn send(&mut self, text: String) -> TransportFuture<'_, ()>;

    /// Wait for the next inbound text frame.
    ///
    /// Returns `Ok(Some(text))` for a message, `Ok(None)` once the peer has closed the
    /// connection cleanly, and `Err` if the read itself failed.
    fn recv(&mut self) -> TransportFuture<'_, Option<String>>;

    /// Close the connection, if it isn't already closed, sending the given WebSocket close
    /// code and reason where the underlying protocol supports it.
    fn close(&mut self, code: u16, reason: &str) -> TransportFuture<'_, ()>;
}

/// A factory for [`Connection`]s.
///
/// `Socket` holds one `Transport` for its whole lifetime and calls
/// [`connect`](Transport::connect) once per connect attempt, each call producing a fresh
/// `Connection` (there is no notion of reusing a half-broken connection object, unlike some
/// platform WebSocket APIs — a failed or closed connection is simply dropped and a new one is
/// dialed).
pub trait Transport: Send + Sync + 'static {
    /// The connection type this transport produces.
    type Connection: Connection;

    /// Dial `uri`, resolving once the WebSocket handshake has completed.
    fn connect<'a>(&'a self, uri: &'a str) -> TransportFuture<'a, Self::Connection>;
}
