use crate::config::{LOADER_BACKOFF_BASE_MS, LOADER_BACKOFF_MAX_MS};
use std::time::Duration;

/// Retry delays for store writes: doubling from `base_ms`, capped at
/// `max_ms`, plus up to a quarter of the capped delay in random jitter so
/// workers that failed together do not retry together.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(LOADER_BACKOFF_BASE_MS, LOADER_BACKOFF_MAX_MS)
    }
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let capped = self.base_ms.saturating_mul(factor).min(self.max_ms);
        let jitter = rand::random::<u64>() % (capped / 4 + 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(capped + jitter)
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double() {
        let mut backoff = Backoff::new(100, 10_000);
        let d1 = backoff.next_delay().as_millis();
        let d2 = backoff.next_delay().as_millis();
        let d3 = backoff.next_delay().as_millis();
        assert!((100..=125).contains(&d1));
        assert!((200..=250).contains(&d2));
        assert!((400..=500).contains(&d3));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = Backoff::new(100, 500);
        for _ in 0..80 {
            assert!(backoff.next_delay().as_millis() <= 625);
        }
    }

    #[test]
    fn default_starts_at_base() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().as_millis() < 2 * LOADER_BACKOFF_BASE_MS as u128);
    }
}
