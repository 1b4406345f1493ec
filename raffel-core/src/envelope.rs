//! The envelope — the uniform in-process message passed between adapters,
//! router, interceptors, and handlers.
//!
//! Every transport parses its wire format into an [`Envelope`] and serializes
//! one (or a sequence of them, for streams) back out. Response and error
//! envelopes derive their id from the request id (`<id>:response`,
//! `<id>:error`); stream frames echo the originating request id unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// The message kind, tagged as `type` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "stream:start")]
    StreamStart,
    #[serde(rename = "stream:data")]
    StreamData,
    #[serde(rename = "stream:end")]
    StreamEnd,
    #[serde(rename = "stream:error")]
    StreamError,
    #[serde(rename = "error")]
    Error,
}

impl EnvelopeKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Event => "event",
            EnvelopeKind::StreamStart => "stream:start",
            EnvelopeKind::StreamData => "stream:data",
            EnvelopeKind::StreamEnd => "stream:end",
            EnvelopeKind::StreamError => "stream:error",
            EnvelopeKind::Error => "error",
        }
    }

    /// Whether this kind initiates a call (as opposed to being a reply frame).
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Request | EnvelopeKind::StreamStart | EnvelopeKind::Event
        )
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged message flowing through the request pipeline.
///
/// Unknown top-level fields are ignored on deserialization. `metadata` is a
/// `BTreeMap` so serialized envelopes are byte-stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    /// Dotted procedure name. Absent only on server-sent broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<String>,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    /// A request envelope with a freshly generated id.
    pub fn request(procedure: impl Into<String>, payload: Value) -> Self {
        Self::request_with_id(uuid::Uuid::new_v4().to_string(), procedure, payload)
    }

    /// A request envelope with a caller-supplied id.
    pub fn request_with_id(
        id: impl Into<String>,
        procedure: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            procedure: Some(procedure.into()),
            kind: EnvelopeKind::Request,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// An event envelope (fire-and-forget, no response expected).
    pub fn event(procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            procedure: Some(procedure.into()),
            kind: EnvelopeKind::Event,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// A stream-start envelope with a freshly generated id.
    pub fn stream_start(procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            procedure: Some(procedure.into()),
            kind: EnvelopeKind::StreamStart,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// The response to this envelope: id becomes `<id>:response`.
    pub fn response(&self, payload: Value) -> Self {
        Self {
            id: format!("{}:response", self.id),
            procedure: self.procedure.clone(),
            kind: EnvelopeKind::Response,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// An error reply to the request with the given id: id becomes `<id>:error`.
    pub fn error_for(request_id: &str, procedure: Option<String>, error: &Error) -> Self {
        Self {
            id: format!("{request_id}:error"),
            procedure,
            kind: EnvelopeKind::Error,
            payload: error.to_payload(),
            metadata: BTreeMap::new(),
        }
    }

    /// A `stream:data` frame carrying one produced item. The id echoes the
    /// originating request id.
    pub fn stream_data(request_id: &str, procedure: Option<String>, payload: Value) -> Self {
        Self {
            id: request_id.to_string(),
            procedure,
            kind: EnvelopeKind::StreamData,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// The single `stream:end` frame emitted on normal completion.
    pub fn stream_end(request_id: &str, procedure: Option<String>) -> Self {
        Self {
            id: request_id.to_string(),
            procedure,
            kind: EnvelopeKind::StreamEnd,
            payload: Value::Null,
            metadata: BTreeMap::new(),
        }
    }

    /// The single `stream:error` frame emitted when a producer fails.
    pub fn stream_error(request_id: &str, procedure: Option<String>, error: &Error) -> Self {
        Self {
            id: request_id.to_string(),
            procedure,
            kind: EnvelopeKind::StreamError,
            payload: error.to_payload(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parse an envelope from JSON bytes.
    ///
    /// Malformed JSON maps to `PARSE_ERROR`; structurally valid JSON that is
    /// not a usable envelope (empty id, inbound kind without a procedure)
    /// maps to `INVALID_ENVELOPE`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::parse(format!("invalid envelope JSON: {e}")))?;
        envelope.check()
    }

    fn check(self) -> Result<Self, Error> {
        if self.id.is_empty() {
            return Err(Error::invalid_envelope("envelope id must not be empty"));
        }
        if self.kind.is_inbound() && self.procedure.is_none() {
            return Err(Error::invalid_envelope(format!(
                "{} envelope requires a procedure",
                self.kind
            )));
        }
        Ok(self)
    }

    /// Serialize to compact JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        // Envelope serialization cannot fail: all fields are JSON-native.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Serialize to a compact JSON string (text-frame transports).
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_id_echoes_request_id() {
        let req = Envelope::request_with_id("abc", "users.create", json!({"name": "x"}));
        let resp = req.response(json!({"ok": true}));
        assert_eq!(resp.id, "abc:response");
        assert_eq!(resp.kind, EnvelopeKind::Response);
        assert_eq!(resp.procedure.as_deref(), Some("users.create"));
    }

    #[test]
    fn error_id_gets_error_suffix() {
        let err = Error::not_found("no such procedure");
        let envelope = Envelope::error_for("abc", None, &err);
        assert_eq!(envelope.id, "abc:error");
        assert_eq!(envelope.kind, EnvelopeKind::Error);
        assert_eq!(envelope.payload["code"], "NOT_FOUND");
    }

    #[test]
    fn stream_frames_carry_request_id() {
        let data = Envelope::stream_data("req-1", Some("counter".into()), json!({"value": 1}));
        let end = Envelope::stream_end("req-1", Some("counter".into()));
        assert_eq!(data.id, "req-1");
        assert_eq!(end.id, "req-1");
        assert_eq!(data.kind, EnvelopeKind::StreamData);
        assert_eq!(end.kind, EnvelopeKind::StreamEnd);
    }

    #[test]
    fn kind_round_trips_wire_names() {
        for kind in [
            EnvelopeKind::Request,
            EnvelopeKind::Response,
            EnvelopeKind::Event,
            EnvelopeKind::StreamStart,
            EnvelopeKind::StreamData,
            EnvelopeKind::StreamEnd,
            EnvelopeKind::StreamError,
            EnvelopeKind::Error,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.as_str()));
            let back: EnvelopeKind = serde_json::from_value(json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let envelope = Envelope::from_json(
            br#"{"id":"1","procedure":"greet","type":"request","payload":{},"x_future":42}"#,
        )
        .unwrap();
        assert_eq!(envelope.procedure.as_deref(), Some("greet"));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = Envelope::from_json(b"{not json").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ParseError);
    }

    #[test]
    fn inbound_without_procedure_is_invalid() {
        let err = Envelope::from_json(br#"{"id":"1","type":"request"}"#).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidEnvelope);
    }

    #[test]
    fn empty_id_is_invalid() {
        let err = Envelope::from_json(br#"{"id":"","procedure":"a","type":"event"}"#).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidEnvelope);
    }
}
