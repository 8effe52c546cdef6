use serde::Deserialize;

use crate::error::ReliableError;

pub const MIN_WINDOW: u32 = 4;
pub const MIN_TIMEOUT_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    /// Sequence space; at most half of it is in flight.
    pub window: u32,
    /// Retransmit and reset-resend interval.
    pub timeout_ms: u64,
    /// Retransmissions of one frame before a reset, and unanswered resets before giving up.
    pub retries: u32,
    /// Longest an ack waits for a data frame to ride on.
    pub ack_delay_ms: u64,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            window: 8,
            timeout_ms: 1000,
            retries: 5,
            ack_delay_ms: 20,
        }
    }
}

impl ReliableConfig {
    pub fn validate(&self) -> Result<(), ReliableError> {
        if self.window < MIN_WINDOW {
            return Err(ReliableError::InvalidConfig(format!("window must be >= {}, not {}", MIN_WINDOW, self.window)));
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(ReliableError::InvalidConfig(format!("timeout must be >= {} ms, not {}", MIN_TIMEOUT_MS, self.timeout_ms)));
        }
        if self.retries == 0 {
            return Err(ReliableError::InvalidConfig("retries must be > 0".to_string()));
        }
        Ok(())
    }
}

/// `window` is the smaller of both sides, `timeout` the larger. Zero means "use mine".
pub fn negotiate(window: u32, timeout_ms: u64, remote_window: u32, remote_timeout_ms: u64) -> (u32, u64) {
    let window = if remote_window > 0 { window.min(remote_window).max(MIN_WINDOW) } else { window };
    let timeout_ms = if remote_timeout_ms > 0 { timeout_ms.max(remote_timeout_ms).max(MIN_TIMEOUT_MS) } else { timeout_ms };
    (window, timeout_ms)
}
