// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A self-healing [Bayeux](https://docs.cometd.org/current/reference/#_bayeux) client that
//! speaks the `websocket` connection type exclusively.
//!
//! The crate is layered in two pieces, mirroring the two state machines that make a Bayeux
//! client over WebSocket actually work in the field:
//!
//! - [`socket::Socket`] is a reconnecting WebSocket wrapper: it owns one [`transport::Transport`]
//!   connection at a time, queues outbound frames while disconnected, and retries connects with
//!   backoff, gated on a [`reachability::Reachability`] oracle.
//! - [`session::Session`] sits on top and speaks Bayeux: handshake, the `/meta/connect`
//!   heartbeat, id-correlated request/response, subscription bookkeeping that survives
//!   reconnects, and server-driven `advice`.
//!
//! Callers that only need the transport-level guarantees (queueing, reconnect, backpressure)
//! without any Bayeux semantics can use [`socket::Socket`] directly; most applications will want
//! [`session::Session`].

#![deny(missing_docs)]

pub mod message;
pub mod reachability;
pub mod retry;
pub mod session;
pub mod socket;
pub mod transport;
pub mod ws;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use message::{Advice, ReconnectAdvice, ResponseError};
pub use reachability::Reachability;
#[cfg(any(test, feature = "test-support"))]
pub use reachability::toggle::Toggle;
pub use session::{Session, SessionBuilder, SessionError, Subscription};
pub use socket::{Socket, SocketBuilder, SocketError};
pub use transport::Transport;
pub use ws::WsTransport;
