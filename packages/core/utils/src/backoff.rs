use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and a small random jitter.
///
/// Every call to [`Backoff::next_delay`] counts as one failed attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    factor: f64,
    jitter: f64,
    current_ms: u64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64, factor: f64) -> Self {
        let initial_ms = initial_ms.max(1);
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            factor: factor.max(1.0),
            jitter: 0.0,
            current_ms: initial_ms,
            attempts: 0,
        }
    }

    /// Randomize each delay by up to `ratio` in either direction.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let base = self.current_ms;
        self.current_ms = ((self.current_ms as f64 * self.factor) as u64).min(self.max_ms);
        let delay = if self.jitter > 0.0 {
            let spread = base as f64 * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (base as f64 + offset).max(1.0) as u64
        } else {
            base
        };
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
        self.attempts = 0;
    }
}
