use std::time::{SystemTime, UNIX_EPOCH};

pub mod backoff;
pub mod error_handle;
pub mod state;
pub mod wait;

pub trait Timer: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Default)]
pub struct SystemTimer();

impl Timer for SystemTimer {
    fn now_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}
