//! The WebSocket JSON frame protocol.
//!
//! Control frames (`subscribe`, `unsubscribe`, `publish`, `ping`, `pong`)
//! share the text channel with ordinary envelopes; the `type` field
//! disambiguates. Binary frames are reserved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use raffel_core::envelope::Envelope;
use raffel_core::error::Error;

#[derive(Debug, Deserialize)]
pub(crate) struct SubscribeFrame {
    pub channel: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub auth: Option<Value>,
    /// Member info for presence channels. Also accepted under `auth.member`.
    #[serde(default)]
    pub member: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UnsubscribeFrame {
    pub channel: String,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishFrame {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PingPongFrame {
    #[serde(default)]
    id: Option<Value>,
}

/// One parsed inbound text frame.
#[derive(Debug)]
pub(crate) enum ClientFrame {
    Subscribe(SubscribeFrame),
    Unsubscribe(UnsubscribeFrame),
    Publish(PublishFrame),
    Ping { id: Option<Value> },
    Pong { id: Option<Value> },
    Envelope(Envelope),
}

pub(crate) fn parse_client_frame(text: &str) -> Result<ClientFrame, Error> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::parse(format!("invalid frame JSON: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_envelope("frame requires a type field"))?
        .to_string();

    fn decode<T: serde::de::DeserializeOwned>(value: Value, kind: &str) -> Result<T, Error> {
        serde_json::from_value(value)
            .map_err(|e| Error::invalid_envelope(format!("malformed {kind} frame: {e}")))
    }

    match kind.as_str() {
        "subscribe" => Ok(ClientFrame::Subscribe(decode(value, "subscribe")?)),
        "unsubscribe" => Ok(ClientFrame::Unsubscribe(decode(value, "unsubscribe")?)),
        "publish" => Ok(ClientFrame::Publish(decode(value, "publish")?)),
        "ping" => {
            let frame: PingPongFrame = decode(value, "ping")?;
            Ok(ClientFrame::Ping { id: frame.id })
        }
        "pong" => {
            let frame: PingPongFrame = decode(value, "pong")?;
            Ok(ClientFrame::Pong { id: frame.id })
        }
        _ => {
            let envelope: Envelope = serde_json::from_value(value)
                .map_err(|e| Error::invalid_envelope(format!("malformed envelope: {e}")))?;
            Ok(ClientFrame::Envelope(envelope))
        }
    }
}

/// One outbound frame. Serialized once, then fanned out by reference.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        /// Full member snapshot, presence channels only.
        #[serde(skip_serializing_if = "Option::is_none")]
        members: Option<Vec<Value>>,
    },
    Unsubscribed {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    Event {
        channel: String,
        event: String,
        data: Value,
    },
    MemberAdded {
        channel: String,
        member: Value,
    },
    MemberRemoved {
        channel: String,
        member: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    Ping {
        id: Value,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
}

impl ServerFrame {
    pub fn error(error: &Error, id: Option<Value>) -> Self {
        ServerFrame::Error {
            code: error.code.as_str().to_string(),
            message: error.message.clone(),
            id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
