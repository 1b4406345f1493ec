//! Route assembly and the REST request path.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::interceptors::RateLimitInfo;
use raffel_core::router::{CallOptions, Reply, Router};
use raffel_core::Extensions;

use crate::config::HttpConfig;
use crate::{cors, rpc, sse, HttpHeaders};

#[derive(Clone)]
pub(crate) struct HttpState {
    pub(crate) router: Arc<Router>,
    pub(crate) config: Arc<HttpConfig>,
    pub(crate) shutdown: CancellationToken,
}

/// Build the axum router exposing `router` over HTTP.
///
/// `shutdown` is the server-wide cancellation root; every request context
/// is linked under it so shutdown drains in-flight calls.
pub fn http_router(
    router: Arc<Router>,
    config: HttpConfig,
    shutdown: CancellationToken,
) -> axum::Router {
    let base_path = config.base_path.clone();
    let rpc_path = config.rpc_path.clone();
    let state = HttpState {
        router,
        config: Arc::new(config),
        shutdown,
    };

    let app = axum::Router::new()
        .route("/healthz", get(healthz))
        .route(
            rpc_path.as_str(),
            post(rpc::call_rpc)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/streams/{name}",
            get(sse::call_stream)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/events/{name}",
            post(call_event)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/{name}",
            post(call_procedure)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .with_state(state);

    let app = match base_path.as_deref() {
        Some(prefix) if prefix != "/" && !prefix.is_empty() => {
            axum::Router::new().nest(prefix, app)
        }
        _ => app,
    };

    app.layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Response {
    json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
}

async fn preflight(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    cors::preflight_response(&state.config.cors, &headers)
}

async fn method_not_allowed() -> Response {
    error_response(&Error::new(
        raffel_core::ErrorCode::MethodNotAllowed,
        "method not allowed",
    ))
}

/// `POST /<name>` → procedure.
pub(crate) async fn call_procedure(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let origin = cors::request_origin(request.headers());
    let mut response = match procedure_inner(&state, &name, request).await {
        Ok(response) => response,
        Err(error) => error_response(&error),
    };
    cors::apply(&state.config.cors, origin.as_deref(), &mut response);
    response
}

async fn procedure_inner(
    state: &HttpState,
    name: &str,
    request: Request,
) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();
    check_content_type(&parts.headers)?;
    check_accept(&parts.headers, "application/json")?;
    let payload = read_json_body(body, state.config.max_body_size).await?;

    let envelope = build_envelope(EnvelopeKind::Request, name, payload, &parts.headers);
    let request_id = envelope.id.clone();

    // Dropping the request future (client gone, connection reset) fires the
    // call's cancellation through this guard.
    let token = state.shutdown.child_token();
    let _disconnect = token.clone().drop_guard();
    let opts = call_options(token, &parts.headers);

    let reply = state.router.handle(envelope, opts).await;
    let mut response = match reply {
        Reply::Response { envelope, ctx } => {
            let mut response = json_response(StatusCode::OK, &envelope.payload);
            apply_rate_limit_headers(&mut response, ctx.extensions().get::<RateLimitInfo>());
            response
        }
        Reply::Error(envelope) => error_response(&Error::from_payload(&envelope.payload)),
        Reply::Stream(_) => error_response(&Error::invalid_argument(
            "streams are served from /streams/<name>",
        )),
    };
    set_header(&mut response, "x-request-id", &request_id);
    Ok(response)
}

/// `POST /events/<name>` → event. Fire-and-forget: routing problems are
/// logged and the caller still gets 202.
pub(crate) async fn call_event(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let origin = cors::request_origin(request.headers());
    let mut response = match event_inner(&state, &name, request).await {
        Ok(response) => response,
        Err(error) => error_response(&error),
    };
    cors::apply(&state.config.cors, origin.as_deref(), &mut response);
    response
}

async fn event_inner(state: &HttpState, name: &str, request: Request) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();
    check_content_type(&parts.headers)?;
    let payload = read_json_body(body, state.config.max_body_size).await?;

    let envelope = build_envelope(EnvelopeKind::Event, name, payload, &parts.headers);
    let request_id = envelope.id.clone();

    let token = state.shutdown.child_token();
    let _disconnect = token.clone().drop_guard();
    let opts = call_options(token, &parts.headers);

    if let Reply::Error(error_envelope) = state.router.handle(envelope, opts).await {
        warn!(
            event = %name,
            code = error_envelope.payload["code"].as_str().unwrap_or(""),
            "event routing failed"
        );
    }
    let mut response = StatusCode::ACCEPTED.into_response();
    set_header(&mut response, "x-request-id", &request_id);
    Ok(response)
}

// ── Shared request plumbing ─────────────────────────────────────────────

pub(crate) fn check_content_type(headers: &HeaderMap) -> Result<(), Error> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|t| t.eq_ignore_ascii_case("application/json"))
    {
        Ok(())
    } else {
        Err(Error::new(
            raffel_core::ErrorCode::UnsupportedMediaType,
            "request bodies must be application/json",
        ))
    }
}

pub(crate) fn check_accept(headers: &HeaderMap, wanted: &str) -> Result<(), Error> {
    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    let acceptable = accept.split(',').any(|entry| {
        let media = entry.split(';').next().unwrap_or("").trim();
        media == "*/*" || media.eq_ignore_ascii_case(wanted) || {
            // e.g. "application/*" vs "application/json"
            media
                .strip_suffix("/*")
                .is_some_and(|prefix| wanted.starts_with(prefix))
        }
    });
    if acceptable {
        Ok(())
    } else {
        Err(Error::new(
            raffel_core::ErrorCode::NotAcceptable,
            format!("no acceptable representation; this endpoint produces {wanted}"),
        ))
    }
}

pub(crate) async fn read_json_body(body: Body, limit: usize) -> Result<Value, Error> {
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| Error::message_too_large(format!("request body exceeds {limit} bytes")))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| Error::parse(format!("invalid JSON body: {e}")))
}

/// Copy `x-*` headers and `authorization` into envelope metadata; generate
/// an `x-request-id` when the client did not send one.
pub(crate) fn build_envelope(
    kind: EnvelopeKind,
    name: &str,
    payload: Value,
    headers: &HeaderMap,
) -> Envelope {
    let id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut envelope = Envelope {
        id,
        procedure: Some(name.to_string()),
        kind,
        payload,
        metadata: BTreeMap::new(),
    };
    for (header_name, header_value) in headers {
        let header_name = header_name.as_str();
        if header_name.starts_with("x-") || header_name == "authorization" {
            if let Ok(value) = header_value.to_str() {
                envelope.metadata.insert(header_name.to_string(), value.to_string());
            }
        }
    }
    envelope
}

pub(crate) fn call_options(token: CancellationToken, headers: &HeaderMap) -> CallOptions {
    let extensions = Extensions::new();
    let mut all = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            all.insert(name.as_str().to_string(), value.to_string());
        }
    }
    extensions.insert(HttpHeaders(all));
    CallOptions {
        cancellation: token,
        deadline: None,
        auth: None,
        extensions,
    }
}

// ── Response plumbing ───────────────────────────────────────────────────

pub(crate) fn json_response(status: StatusCode, payload: &Value) -> Response {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"null".to_vec());
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Error payload as body, status from the mapping table, rate-limit
/// headers when applicable.
pub(crate) fn error_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = json_response(status, &error.to_payload());
    if status == StatusCode::TOO_MANY_REQUESTS {
        let details = error.details.clone().unwrap_or(Value::Null);
        if let Some(limit) = details.get("limit").and_then(Value::as_u64) {
            set_header(&mut response, "x-ratelimit-limit", &limit.to_string());
        }
        let remaining = details
            .get("remaining")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        set_header(&mut response, "x-ratelimit-remaining", &remaining.to_string());
        let retry_after = details
            .get("retry_after_secs")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        set_header(&mut response, "retry-after", &retry_after.to_string());
    }
    response
}

pub(crate) fn apply_rate_limit_headers(response: &mut Response, info: Option<RateLimitInfo>) {
    if let Some(info) = info {
        set_header(response, "x-ratelimit-limit", &info.limit.to_string());
        set_header(response, "x-ratelimit-remaining", &info.remaining.to_string());
    }
}

pub(crate) fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn content_type_allows_charset_suffix() {
        assert!(check_content_type(&headers_with(
            "content-type",
            "application/json; charset=utf-8"
        ))
        .is_ok());
        assert!(check_content_type(&headers_with("content-type", "text/plain")).is_err());
        assert!(check_content_type(&HeaderMap::new()).is_err());
    }

    #[test]
    fn accept_matches_wildcards() {
        assert!(check_accept(&HeaderMap::new(), "application/json").is_ok());
        assert!(check_accept(&headers_with("accept", "*/*"), "application/json").is_ok());
        assert!(check_accept(&headers_with("accept", "application/*"), "application/json").is_ok());
        assert!(
            check_accept(&headers_with("accept", "text/html"), "application/json").is_err()
        );
        assert!(check_accept(
            &headers_with("accept", "text/event-stream"),
            "text/event-stream"
        )
        .is_ok());
    }

    #[test]
    fn envelope_metadata_captures_x_headers_and_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        let envelope =
            build_envelope(EnvelopeKind::Request, "greet", Value::Null, &headers);
        assert_eq!(envelope.metadata.get("x-tenant").map(String::as_str), Some("acme"));
        assert_eq!(
            envelope.metadata.get("authorization").map(String::as_str),
            Some("Bearer t")
        );
        assert!(!envelope.metadata.contains_key("content-length"));
        assert!(!envelope.id.is_empty());
    }

    #[test]
    fn request_id_header_is_respected() {
        let headers = headers_with("x-request-id", "req-42");
        let envelope = build_envelope(EnvelopeKind::Request, "greet", Value::Null, &headers);
        assert_eq!(envelope.id, "req-42");
    }
}
