use std::time::Duration;

/// Upstream connection and request-lifecycle settings.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: String,
    /// Bound on a single WebSocket handshake.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts before the supervisor gives up.
    pub max_retries: u32,
    /// Wait for a unary response.
    pub request_timeout: Duration,
    /// Wait for each stream delivery.
    pub stream_idle_timeout: Duration,
    pub auth_timeout: Duration,
    /// Capacity of each per-request delivery channel.
    pub channel_capacity: usize,
    /// Fail every pending request as soon as the connection drops instead
    /// of letting each one run into its own timeout.
    pub fail_pending_on_disconnect: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.husky.gg/api".into(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            max_retries: 5,
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            fail_pending_on_disconnect: true,
        }
    }
}
