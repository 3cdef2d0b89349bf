//! Epoch clock driven by tokio's monotonic timer
//!
//! Wall time is sampled once and advanced with `tokio::time::Instant`, so
//! timelock arithmetic agrees with `tokio::time::sleep` (including paused
//! time in tests).

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl Clock {
    pub fn new() -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::starting_at(now_ms)
    }

    /// Clock anchored at a given epoch time in milliseconds
    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms: epoch_ms,
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.origin_epoch_ms + self.origin.elapsed().as_millis() as u64
    }

    pub fn now_secs(&self) -> u64 {
        self.now_millis() / 1_000
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::starting_at(1_700_000_000_000);
        assert_eq!(clock.now_secs(), 1_700_000_000);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now_secs(), 1_700_000_030);
    }
}
