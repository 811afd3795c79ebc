//! Reconnection tuning options.

use std::time::Duration;

/// Tuning knobs for [`ReconnectingWebSocket`](crate::ReconnectingWebSocket).
///
/// The defaults match the common client configuration: reconnect forever,
/// backoff from 1s to 10s growing by 1.3x, accept a connection as healthy
/// after 5s of uptime, and give a connection attempt 4s to complete its
/// handshake.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Upper bound for the delay between reconnection attempts.
    pub max_reconnection_delay: Duration,

    /// Delay before the second connection attempt (the first is immediate).
    pub min_reconnection_delay: Duration,

    /// Multiplier applied to the delay for each consecutive failure.
    pub reconnection_delay_grow_factor: f64,

    /// How long a connection must stay open before the retry counter resets.
    /// Prevents a rapid connect/drop loop from being treated as healthy.
    pub min_uptime: Duration,

    /// How long a connection attempt may take before it is treated as a
    /// failure (synthetic `TIMEOUT` error).
    pub connection_timeout: Duration,

    /// Maximum number of failed attempts before the transport stops retrying
    /// silently. `None` retries forever. A manual
    /// [`reconnect`](crate::ReconnectingWebSocket::reconnect) resumes.
    pub max_retries: Option<u32>,

    /// Maximum number of messages queued while disconnected. Sends beyond
    /// capacity are dropped silently. `None` is unbounded.
    pub max_enqueued_messages: Option<usize>,

    /// Start in the closed state instead of connecting immediately.
    pub start_closed: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_reconnection_delay: Duration::from_secs(10),
            min_reconnection_delay: Duration::from_secs(1),
            reconnection_delay_grow_factor: 1.3,
            min_uptime: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(4),
            max_retries: None,
            max_enqueued_messages: None,
            start_closed: false,
        }
    }
}

impl ReconnectOptions {
    /// Compute the backoff delay before the attempt following `retry_count`
    /// failed attempts. The first attempt is immediate.
    pub fn next_reconnection_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = self
            .reconnection_delay_grow_factor
            .powi(retry_count as i32 - 1);
        let delay = self.min_reconnection_delay.mul_f64(factor);
        delay.min(self.max_reconnection_delay)
    }
}
