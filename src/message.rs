// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bayeux wire types: outbound request payloads, the inbound message envelope, and `advice`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of the server's `advice` field, telling the client how to behave after the
/// current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectAdvice {
    /// Reconnect using the existing `clientId`; no re-handshake needed.
    Retry,
    /// The `clientId` is no longer valid; a fresh `/meta/handshake` is required.
    Handshake,
    /// Do not attempt to reconnect at all.
    None,
}

/// Server-issued guidance for reconnect timing and strategy.
///
/// Per the Bayeux protocol, `advice` received on any message replaces the session's current
/// advice wholesale rather than merging field-by-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Advice {
    /// What to do when the current connection is lost.
    pub reconnect: ReconnectAdvice,
    /// Milliseconds to wait before the next `/meta/connect`, per the server's pacing.
    pub interval: u64,
}

impl Default for Advice {
    fn default() -> Self {
        Advice {
            reconnect: ReconnectAdvice::Retry,
            interval: 1000,
        }
    }
}

/// A structured Bayeux error string, e.g. `"402:clientId:Unknown client"`.
///
/// The Bayeux protocol encodes errors as a single colon-delimited string rather than a
/// structured object; this type parses that convention so callers don't have to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct ResponseError {
    /// The three-digit error code, e.g. `402`.
    pub code: u32,
    /// Additional error arguments, e.g. the offending field names.
    pub args: Vec<String>,
    /// A human-readable description.
    pub description: String,
}

impl ResponseError {
    /// Parse a Bayeux `"<code>:<args>:<description>"` error string.
    ///
    /// Malformed input (missing a code, or a code that isn't a number) is preserved rather
    /// than rejected: `code` is `0` and the whole string becomes the description.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, ':');
        let code = parts.next().and_then(|s| s.parse().ok());
        let args = parts.next();
        let description = parts.next();

        match (code, description) {
            (Some(code), Some(description)) => ResponseError {
                code,
                args: args
                    .map(|a| a.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
                    .unwrap_or_default(),
                description: description.to_owned(),
            },
            _ => ResponseError {
                code: 0,
                args: Vec::new(),
                description: raw.to_owned(),
            },
        }
    }
}

/// An outbound frame queued for delivery.
///
/// `client_id` is deliberately absent here: it is stamped onto the wire object at flush time
/// (see [`crate::socket::Socket`]'s serialize hook), using whatever `clientId` is current at
/// that moment rather than whatever was current when the frame was queued. This is what lets
/// messages queued while disconnected pick up the `clientId` from the handshake that
/// eventually lets them flush.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The monotonically increasing message id, assigned when the frame is queued.
    pub id: u64,
    /// The Bayeux channel this frame targets.
    pub channel: String,
    /// Remaining fields of the message object (e.g. `data`, `subscription`, `ext`), already
    /// serialized to JSON.
    pub body: Map<String, Value>,
}

impl Frame {
    /// Build a frame from a typed payload, merging its fields alongside `channel`.
    pub fn new(id: u64, channel: impl Into<String>, payload: impl Serialize) -> serde_json::Result<Self> {
        let body = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_owned(), other);
                map
            }
        };
        Ok(Frame { id, channel: channel.into(), body })
    }

    /// Render this frame as the single-element JSON array Bayeux expects on the wire,
    /// stamping `client_id` if one is current.
    pub fn to_wire_text(&self, client_id: Option<&str>) -> String {
        let mut object = self.body.clone();
        object.insert("id".to_owned(), Value::String(self.id.to_string()));
        object.insert("channel".to_owned(), Value::String(self.channel.clone()));
        if let Some(client_id) = client_id {
            object.insert("clientId".to_owned(), Value::String(client_id.to_owned()));
        }
        Value::Array(vec![Value::Object(object)]).to_string()
    }
}

/// The body of a `/meta/handshake` request.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    /// The Bayeux protocol version this client speaks.
    pub version: &'static str,
    #[serde(rename = "supportedConnectionTypes")]
    /// Connection types offered to the server. This client only ever offers `websocket`.
    pub supported_connection_types: &'static [&'static str],
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        HandshakeRequest {
            version: "1.0",
            supported_connection_types: &["websocket"],
        }
    }
}

/// The body of a `/meta/connect` request.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    #[serde(rename = "connectionType")]
    /// Always `"websocket"` for this client.
    pub connection_type: &'static str,
}

impl Default for ConnectRequest {
    fn default() -> Self {
        ConnectRequest { connection_type: "websocket" }
    }
}

/// The body of a `/meta/disconnect` request. Carries no fields of its own.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DisconnectRequest {}

/// The body of a `/meta/subscribe` request.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    /// The channel being subscribed to.
    pub subscription: String,
}

/// The body of a `/meta/unsubscribe` request.
#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeRequest {
    /// The channel being unsubscribed from.
    pub subscription: String,
}

/// The subset of an inbound message's fields the session needs in order to route it,
/// extracted without committing to a full schema for the message as a whole.
///
/// Extra fields present on the wire (including application data) are ignored here and left
/// in the original [`Value`] handed to whichever handler ultimately receives the message.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InboundFields {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub successful: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub advice: Option<Advice>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
}

/// Accept a Bayeux `id` sent either as a string (this client's own convention, see
/// [`Frame::to_wire_text`]) or as a bare JSON number (some servers echo the numeric form back
/// verbatim), normalizing either to a string so response correlation doesn't depend on which
/// convention the far end chose.
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdValue {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(Option::<IdValue>::deserialize(deserializer)?.map(|value| match value {
        IdValue::Str(s) => s,
        IdValue::Num(n) => n.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response_error() {
        let err = ResponseError::parse("402:clientId:Unknown client");
        assert_eq!(err.code, 402);
        assert_eq!(err.args, vec!["clientId".to_owned()]);
        assert_eq!(err.description, "Unknown client");
    }

    #[test]
    fn falls_back_on_malformed_response_error() {
        let err = ResponseError::parse("not a bayeux error");
        assert_eq!(err.code, 0);
        assert_eq!(err.description, "not a bayeux error");
    }

    #[test]
    fn stamps_client_id_at_wire_time_not_queue_time() {
        let frame = Frame::new(7, "/some/channel", SubscribeRequest { subscription: "/foo".into() }).unwrap();
        let text = frame.to_wire_text(Some("abc123"));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let obj = &parsed[0];
        assert_eq!(obj["clientId"], "abc123");
        assert_eq!(obj["id"], "7");
        assert_eq!(obj["channel"], "/some/channel");
        assert_eq!(obj["subscription"], "/foo");
    }

    #[test]
    fn inbound_id_accepts_both_string_and_numeric_form() {
        let from_string: InboundFields = serde_json::from_value(serde_json::json!({
            "id": "3", "channel": "/meta/subscribe", "successful": true,
        }))
        .unwrap();
        assert_eq!(from_string.id.as_deref(), Some("3"));

        let from_number: InboundFields = serde_json::from_value(serde_json::json!({
            "id": 3, "channel": "/meta/subscribe", "successful": true,
        }))
        .unwrap();
        assert_eq!(from_number.id.as_deref(), Some("3"));
    }
}
