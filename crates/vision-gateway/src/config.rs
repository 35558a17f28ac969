use std::time::Duration;

/// Timing and limits for the socket layer.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Pending connections that have not sent `auth` within this window are closed.
    pub auth_timeout: Duration,
    /// Delay between a user's last disconnect and the `offline` broadcast.
    pub presence_grace: Duration,
    /// Users without activity for this long are marked `away`.
    pub idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
    /// Typing indicators expire after this long without a fresh `typing_start`.
    pub typing_ttl: Duration,
    pub persist_timeout: Duration,
    /// Base delay before the single persistence retry.
    pub persist_backoff: Duration,
    /// Server ping interval; two missed pongs drop the connection.
    pub heartbeat_interval: Duration,
    pub max_content_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            presence_grace: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(300),
            idle_sweep_interval: Duration::from_secs(30),
            typing_ttl: Duration::from_secs(8),
            persist_timeout: Duration::from_secs(5),
            persist_backoff: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(15),
            max_content_len: 10_000,
        }
    }
}
