//! Server configuration: CLI-facing knobs plus environment overrides.
//!
//! Environment variables: `RAFFEL_LOG_LEVEL` (trace|debug|info|warn|error)
//! feeds [`init_tracing`]; `RAFFEL_SHUTDOWN_GRACE_MS` bounds the shutdown
//! drain. `.env` files are honored via dotenvy.

use std::time::Duration;

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(5000);

/// A configuration value that could not be interpreted. Server binaries
/// exit with code 2 on this.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid value {:?} for {}: {}",
            self.value, self.key, self.reason
        )
    }
}

impl std::error::Error for ConfigError {}

/// Shared server knobs, independent of any one transport.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional URL prefix stripped uniformly by the HTTP adapter.
    pub base_path: Option<String>,
    /// Maximum accepted request body, in bytes.
    pub max_body_size: usize,
    /// How long shutdown waits for in-flight calls to drain.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_path: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("RAFFEL_SHUTDOWN_GRACE_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError {
                key: "RAFFEL_SHUTDOWN_GRACE_MS".to_string(),
                value: raw.clone(),
                reason: "expected an integer millisecond count".to_string(),
            })?;
            config.shutdown_grace = Duration::from_millis(millis);
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Install the global tracing subscriber, honoring `RAFFEL_LOG_LEVEL`.
///
/// Safe to call more than once; only the first call wins.
pub fn init_tracing() {
    let filter = std::env::var("RAFFEL_LOG_LEVEL")
        .ok()
        .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.max_body_size, 1024 * 1024);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }
}
