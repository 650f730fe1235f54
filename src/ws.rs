// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The production [`Transport`] implementation, backed by `async-tungstenite` over Tokio.

use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::Message as WsMessage;
use async_tungstenite::WebSocketStream;
use futures::{SinkExt, StreamExt};

use crate::transport::{Connection, Transport, TransportError, TransportFuture};

/// A [`Transport`] that dials real WebSocket connections.
///
/// This is a zero-sized type: all per-connection state lives on the [`WsConnection`] produced
/// by [`Transport::connect`], not on the transport itself, so the same `WsTransport` can be
/// shared freely across [`crate::socket::Socket`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    type Connection = WsConnection;

    fn connect<'a>(&'a self, uri: &'a str) -> TransportFuture<'a, Self::Connection> {
        Box::pin(async move {
            let (stream, _response) = connect_async(uri)
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            Ok(WsConnection { stream })
        })
    }
}

/// A live connection produced by [`WsTransport`].
pub struct WsConnection {
    stream: WebSocketStream<ConnectStream>,
}

impl Connection for WsConnection {
    fn send(&mut self, text: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.stream
                .send(WsMessage::Text(text))
                .await
                .map_err(|err| TransportError::Write(err.to_string()))
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<String>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    None => return Ok(None),
                    Some(Ok(WsMessage::Text(text))) => return Ok(Some(text)),
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    // Ping/Pong/Binary/Frame carry no Bayeux content; keep reading.
                    Some(Ok(_)) => continue,
                    Some(Err(async_tungstenite::tungstenite::Error::ConnectionClosed | async_tungstenite::tungstenite::Error::AlreadyClosed)) => {
                        return Ok(None)
                    }
                    Some(Err(err)) => return Err(TransportError::Read(err.to_string())),
                }
            }
        })
    }

    fn close(&mut self, code: u16, reason: &str) -> TransportFuture<'_, ()> {
        let reason = reason.to_owned();
        Box::pin(async move {
            use async_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
            let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
            // A close error here almost always means the connection was already gone; there's
            // nothing further to do about it.
            let _ = self.stream.close(Some(frame)).await;
            Ok(())
        })
    }
}
