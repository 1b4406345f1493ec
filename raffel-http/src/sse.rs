//! SSE streaming: `GET /streams/<name>` iterates the stream engine's
//! envelope frames into `text/event-stream`.
//!
//! Frame mapping: `stream:data` → `event: data`, `stream:end` → `event:
//! end`, `stream:error` → `event: error`; the `data:` line is the JSON of
//! the payload. Client disconnect drops the body stream, which cancels the
//! call context through its disconnect guard.

use axum::extract::{Path, RawQuery, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http::HeaderMap;
use serde_json::Value;

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::router::Reply;

use crate::adapter::{
    build_envelope, call_options, check_accept, error_response, set_header, HttpState,
};
use crate::cors;

pub(crate) async fn call_stream(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let origin = cors::request_origin(&headers);
    let mut response = match stream_inner(&state, &name, query, &headers).await {
        Ok(response) => response,
        Err(error) => error_response(&error),
    };
    cors::apply(&state.config.cors, origin.as_deref(), &mut response);
    response
}

async fn stream_inner(
    state: &HttpState,
    name: &str,
    query: Option<String>,
    headers: &HeaderMap,
) -> Result<Response, Error> {
    check_accept(headers, "text/event-stream")?;
    let payload = query_payload(query.as_deref().unwrap_or(""));

    let envelope = build_envelope(EnvelopeKind::StreamStart, name, payload, headers);
    let request_id = envelope.id.clone();

    let token = state.shutdown.child_token();
    let disconnect = token.clone().drop_guard();
    let opts = call_options(token, headers);

    match state.router.handle(envelope, opts).await {
        Reply::Stream(frames) => {
            let frames = frames.with_disconnect_guard(disconnect);
            let stream = frames.map(|frame| Ok::<Event, std::convert::Infallible>(to_sse_event(frame)));
            let mut response = Sse::new(stream).into_response();
            set_header(&mut response, "cache-control", "no-cache");
            set_header(&mut response, "connection", "keep-alive");
            set_header(&mut response, "x-accel-buffering", "no");
            set_header(&mut response, "x-request-id", &request_id);
            Ok(response)
        }
        Reply::Error(envelope) => Err(Error::from_payload(&envelope.payload)),
        Reply::Response { .. } => Err(Error::invalid_argument(format!(
            "{name:?} is not a stream"
        ))),
    }
}

fn to_sse_event(frame: Envelope) -> Event {
    let event_name = match frame.kind {
        EnvelopeKind::StreamEnd => "end",
        EnvelopeKind::StreamError => "error",
        _ => "data",
    };
    let data = serde_json::to_string(&frame.payload).unwrap_or_else(|_| "null".to_string());
    Event::default().event(event_name).data(data)
}

/// Build the stream payload from the query string. Values that parse as
/// JSON scalars keep their type (`count=3` → number 3); everything else
/// stays a string.
fn query_payload(query: &str) -> Value {
    if query.is_empty() {
        return Value::Null;
    }
    let mut object = serde_json::Map::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        let parsed = serde_json::from_str::<Value>(&value)
            .ok()
            .filter(|v| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| Value::String(value.to_string()));
        object.insert(key.to_string(), parsed);
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_values_keep_scalar_types() {
        let payload = query_payload("count=3&label=abc&flag=true");
        assert_eq!(payload, json!({"count": 3, "label": "abc", "flag": true}));
    }

    #[test]
    fn empty_query_is_null_payload() {
        assert_eq!(query_payload(""), Value::Null);
    }

    #[test]
    fn frame_kinds_map_to_event_names() {
        let end = to_sse_event(Envelope::stream_end("r", None));
        assert!(format!("{end:?}").contains("end"));
        let data = to_sse_event(Envelope::stream_data("r", None, json!({"value": 1})));
        let repr = format!("{data:?}");
        assert!(repr.contains("data"));
        assert!(repr.contains("value"));
    }
}
