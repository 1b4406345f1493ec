use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

/// In-process HTTP test client wrapping an axum `Router`.
///
/// Uses `tower::ServiceExt::oneshot` to dispatch requests without binding
/// to a TCP port, which also makes SSE bodies finite: the response body is
/// collected after the stream completes.
pub struct TestApp {
    router: Router,
}

impl TestApp {
    /// Create a `TestApp` from an assembled axum `Router`.
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Send an arbitrary request.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("failed to send request");

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// `POST /<name>` with a JSON body — a procedure call.
    pub async fn call(&self, name: &str, body: &impl serde::Serialize) -> TestResponse {
        self.post_json(&format!("/{name}"), body).await
    }

    /// `POST /events/<name>` with a JSON body — an event.
    pub async fn event(&self, name: &str, body: &impl serde::Serialize) -> TestResponse {
        self.post_json(&format!("/events/{name}"), body).await
    }

    /// `GET /streams/<name>?query` — collects the whole SSE body.
    pub async fn stream(&self, name: &str, query: &str) -> TestResponse {
        let uri = if query.is_empty() {
            format!("/streams/{name}")
        } else {
            format!("/streams/{name}?{query}")
        };
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(ACCEPT, "text/event-stream")
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }

    /// `POST /rpc` with a raw JSON-RPC payload (single or batch).
    pub async fn rpc(&self, payload: &serde_json::Value) -> TestResponse {
        self.post_json("/rpc", payload).await
    }

    /// Send a GET request to the given path.
    pub async fn get(&self, path: &str) -> TestResponse {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }

    /// Send a POST request with a JSON body.
    pub async fn post_json(&self, path: &str, body: &impl serde::Serialize) -> TestResponse {
        let json = serde_json::to_vec(body).unwrap();
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .unwrap();
        self.send(req).await
    }

    /// Send a POST with explicit raw bytes and content type.
    pub async fn post_raw(&self, path: &str, content_type: &str, body: Vec<u8>) -> TestResponse {
        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        self.send(req).await
    }

    /// Send an OPTIONS preflight with an Origin header.
    pub async fn preflight(&self, path: &str, origin: &str) -> TestResponse {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri(path)
            .header("origin", origin)
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }
}

/// A fully collected response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    /// Parse the body as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }

    /// The body as UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    /// A response header as a string, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
