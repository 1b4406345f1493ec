//! HTTP adapter for Raffel.
//!
//! Maps the registry onto REST-ish URLs (`POST /<name>` for procedures,
//! `GET /streams/<name>` for SSE streams, `POST /events/<name>` for
//! events), enforces content negotiation and body limits, wires client
//! disconnects into call cancellation, and mounts the JSON-RPC 2.0
//! endpoint on the same router.
//!
//! The produced [`axum::Router`] is plain axum: serve it with
//! `axum::serve`, merge it into a bigger app, or drive it in-process with
//! `tower::ServiceExt::oneshot` in tests.

mod adapter;
mod config;
mod cors;
mod rpc;
mod sse;

use std::collections::BTreeMap;

pub use adapter::http_router;
pub use config::{CorsConfig, HttpConfig};

/// All request headers, seeded into the call context under a typed key.
///
/// Interceptors and handlers read them via
/// `ctx.extensions().get::<HttpHeaders>()`.
#[derive(Debug, Clone)]
pub struct HttpHeaders(pub BTreeMap<String, String>);
