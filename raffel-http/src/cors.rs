//! Adapter-local CORS: exact-match or wildcard origin allowlist, 204
//! preflights carrying the configured headers.

use axum::response::Response;
use http::header::{HeaderValue, ORIGIN};
use http::HeaderMap;

use crate::config::CorsConfig;

pub(crate) fn request_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn origin_allowed(config: &CorsConfig, origin: &str) -> bool {
    config
        .allowed_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == origin)
}

/// Answer a preflight: always 204, CORS headers only for allowed origins.
pub(crate) fn preflight_response(config: &CorsConfig, headers: &HeaderMap) -> Response {
    let mut response = Response::builder()
        .status(http::StatusCode::NO_CONTENT)
        .body(axum::body::Body::empty())
        .unwrap_or_default();
    if let Some(origin) = request_origin(headers) {
        if origin_allowed(config, &origin) {
            let headers = response.headers_mut();
            insert(headers, "access-control-allow-origin", &origin);
            insert(headers, "access-control-allow-methods", &config.allow_methods);
            insert(headers, "access-control-allow-headers", &config.allow_headers);
            insert(
                headers,
                "access-control-max-age",
                &config.max_age_secs.to_string(),
            );
        }
    }
    response
}

/// Mark a normal response as CORS-visible for an allowed origin.
pub(crate) fn apply(config: &CorsConfig, origin: Option<&str>, response: &mut Response) {
    if let Some(origin) = origin {
        if origin_allowed(config, origin) {
            insert(response.headers_mut(), "access-control-allow-origin", origin);
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allows_any_origin() {
        let config = CorsConfig::default();
        assert!(origin_allowed(&config, "https://example.com"));
    }

    #[test]
    fn allowlist_is_exact_match() {
        let config = CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..CorsConfig::default()
        };
        assert!(origin_allowed(&config, "https://app.example.com"));
        assert!(!origin_allowed(&config, "https://evil.example.com"));
        assert!(!origin_allowed(&config, "https://app.example.com.evil"));
    }

    #[test]
    fn preflight_is_204_with_headers() {
        let config = CorsConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("https://example.com"));
        let response = preflight_response(&config, &headers);
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("https://example.com")
        );
    }

    #[test]
    fn preflight_without_match_has_no_cors_headers() {
        let config = CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..CorsConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, HeaderValue::from_static("https://other.com"));
        let response = preflight_response(&config, &headers);
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
