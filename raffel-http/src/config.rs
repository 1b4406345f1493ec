//! HTTP adapter configuration.

use raffel_core::config::{ServerConfig, DEFAULT_MAX_BODY_SIZE};

/// CORS policy applied by the adapter itself (preflights answer 204).
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Exact-match origins, or `"*"` for any.
    pub allowed_origins: Vec<String>,
    pub allow_methods: String,
    pub allow_headers: String,
    pub max_age_secs: u32,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allow_methods: "GET, POST, OPTIONS".to_string(),
            allow_headers: "content-type, authorization, x-request-id".to_string(),
            max_age_secs: 86400,
        }
    }
}

/// Knobs for the HTTP adapter.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Optional URL prefix; stripped uniformly from every route.
    pub base_path: Option<String>,
    /// Maximum accepted request body, in bytes.
    pub max_body_size: usize,
    /// Where the JSON-RPC endpoint is mounted.
    pub rpc_path: String,
    pub cors: CorsConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            rpc_path: "/rpc".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

impl HttpConfig {
    /// Derive adapter config from the shared server config.
    pub fn from_server(server: &ServerConfig) -> Self {
        Self {
            base_path: server.base_path.clone(),
            max_body_size: server.max_body_size,
            ..Self::default()
        }
    }
}
