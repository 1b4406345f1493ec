//! JSON-RPC 2.0 endpoint: single requests, batches, and notifications on
//! one POST route, mapped onto the same router as every other transport.

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde_json::{json, Value};
use tracing::warn;

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::registry::HandlerKind;
use raffel_core::router::Reply;

use crate::adapter::{
    call_options, check_content_type, error_response, json_response, read_json_body, HttpState,
};

pub(crate) async fn call_rpc(State(state): State<HttpState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    if let Err(error) = check_content_type(&parts.headers) {
        return error_response(&error);
    }
    let raw = match read_json_body(body, state.config.max_body_size).await {
        Ok(raw) => raw,
        Err(error) if error.code == raffel_core::ErrorCode::ParseError => {
            return json_response(
                StatusCode::OK,
                &rpc_error_entry(Value::Null, -32700, "Parse error", None),
            )
        }
        Err(error) => return error_response(&error),
    };

    // Request contexts hang off the server root; dropping this guard on
    // client disconnect cancels every entry of the batch.
    let token = state.shutdown.child_token();
    let _disconnect = token.clone().drop_guard();

    match raw {
        Value::Array(entries) if entries.is_empty() => json_response(
            StatusCode::OK,
            &rpc_error_entry(Value::Null, -32600, "Invalid Request: empty batch", None),
        ),
        Value::Array(entries) => {
            let results = futures_util::future::join_all(
                entries
                    .into_iter()
                    .map(|entry| dispatch_entry(&state, &parts.headers, &token, entry)),
            )
            .await;
            let responses: Vec<Value> = results.into_iter().flatten().collect();
            if responses.is_empty() {
                // A batch of only notifications gets no body at all.
                StatusCode::NO_CONTENT.into_response()
            } else {
                json_response(StatusCode::OK, &Value::Array(responses))
            }
        }
        single => match dispatch_entry(&state, &parts.headers, &token, single).await {
            Some(response) => json_response(StatusCode::OK, &response),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    }
}

/// Route one batch entry. `None` for notifications (no response emitted).
async fn dispatch_entry(
    state: &HttpState,
    headers: &http::HeaderMap,
    token: &tokio_util::sync::CancellationToken,
    entry: Value,
) -> Option<Value> {
    let Some(object) = entry.as_object() else {
        return Some(rpc_error_entry(
            Value::Null,
            -32600,
            "Invalid Request: expected an object",
            None,
        ));
    };

    // Missing id → notification. A present-but-null id still gets a reply.
    let id = object.get("id").cloned();
    let is_notification = id.is_none();
    let reply_id = id.unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return respond_unless_notification(is_notification, || {
            rpc_error_entry(reply_id.clone(), -32600, "Invalid Request: jsonrpc must be \"2.0\"", None)
        });
    }
    let method = match object.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => method.to_string(),
        _ => {
            return respond_unless_notification(is_notification, || {
                rpc_error_entry(
                    reply_id.clone(),
                    -32600,
                    "Invalid Request: method must be a non-empty string",
                    None,
                )
            })
        }
    };

    let payload = convert_params(object.get("params"));

    // The envelope kind follows the registered handler so events stay
    // fire-and-forget over JSON-RPC too. Streams have no JSON-RPC surface.
    let kind = match state.router.registry().lookup_def(&method).map(|def| def.kind) {
        Some(HandlerKind::Event) => EnvelopeKind::Event,
        Some(HandlerKind::Stream) => {
            let error = Error::unimplemented("streams are not available over JSON-RPC");
            return respond_unless_notification(is_notification, || {
                rpc_error_for(reply_id.clone(), &error)
            });
        }
        _ => EnvelopeKind::Request,
    };

    let envelope_id = match &reply_id {
        Value::Null => uuid::Uuid::new_v4().to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut envelope = crate::adapter::build_envelope(kind, &method, payload, headers);
    envelope.id = envelope_id;

    // The `_meta` extension is forwarded into envelope metadata.
    if let Some(meta) = object.get("_meta").and_then(Value::as_object) {
        for (key, value) in meta {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            envelope.metadata.insert(key.clone(), value);
        }
    }

    let opts = call_options(token.clone(), headers);
    match state.router.handle(envelope, opts).await {
        Reply::Response { envelope, .. } => {
            respond_unless_notification(is_notification, || {
                json!({ "jsonrpc": "2.0", "result": envelope.payload, "id": reply_id })
            })
        }
        Reply::Error(envelope) => {
            let error = Error::from_payload(&envelope.payload);
            if is_notification {
                warn!(method = %method, code = %error.code, "notification failed");
                None
            } else {
                Some(rpc_error_for(reply_id, &error))
            }
        }
        Reply::Stream(_) => {
            // Unreachable: stream methods were rejected above.
            respond_unless_notification(is_notification, || {
                rpc_error_for(
                    reply_id.clone(),
                    &Error::internal("unexpected stream reply"),
                )
            })
        }
    }
}

fn respond_unless_notification(
    is_notification: bool,
    entry: impl FnOnce() -> Value,
) -> Option<Value> {
    if is_notification {
        None
    } else {
        Some(entry())
    }
}

/// `params` conversion: object → payload, one-element array → that
/// element, longer array → the array itself, absent → null.
fn convert_params(params: Option<&Value>) -> Value {
    match params {
        None => Value::Null,
        Some(Value::Array(items)) if items.len() == 1 => items[0].clone(),
        Some(other) => other.clone(),
    }
}

fn rpc_error_for(id: Value, error: &Error) -> Value {
    rpc_error_entry(
        id,
        error.json_rpc_code(),
        &error.message,
        error.details.clone(),
    )
}

fn rpc_error_entry(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "error": error, "id": id })
}
