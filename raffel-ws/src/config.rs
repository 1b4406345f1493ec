//! WebSocket adapter configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Upgrade path.
    pub path: String,
    /// Server ping cadence. Two consecutive missed pongs close the
    /// connection.
    pub heartbeat_interval: Duration,
    /// Outbound mailbox high-water mark per connection; the oldest frame is
    /// dropped beyond it.
    pub mailbox_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            mailbox_capacity: 256,
        }
    }
}
