//! Link traffic timestamps shared between the reactor and the worker
//!
//! The reactor stamps reads and writes as it performs them; the worker's ping
//! timer reads the stamps to decide when to send a keep-alive and when a silent
//! peer should be declared dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct LinkActivity {
    base: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl LinkActivity {
    pub fn new(now: Instant) -> Self {
        Self {
            base: now,
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn offset(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.base).as_millis() as u64
    }

    pub fn touch_read(&self, now: Instant) {
        self.last_read_ms.fetch_max(self.offset(now), Ordering::Relaxed);
    }

    pub fn touch_write(&self, now: Instant) {
        self.last_write_ms.fetch_max(self.offset(now), Ordering::Relaxed);
    }

    /// Time since anything was read
    pub fn read_idle(&self, now: Instant) -> Duration {
        let last = self.last_read_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.offset(now).saturating_sub(last))
    }

    /// Time since anything was written
    pub fn write_idle(&self, now: Instant) -> Duration {
        let last = self.last_write_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.offset(now).saturating_sub(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_times_track_touches() {
        let start = Instant::now();
        let activity = LinkActivity::new(start);

        tokio::time::advance(Duration::from_secs(3)).await;
        activity.touch_write(Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;

        let now = Instant::now();
        assert_eq!(activity.read_idle(now), Duration::from_secs(5));
        assert_eq!(activity.write_idle(now), Duration::from_secs(2));
    }

    #[test]
    fn test_stale_touch_does_not_rewind() {
        let start = Instant::now();
        let activity = LinkActivity::new(start);
        let later = start + Duration::from_secs(10);

        activity.touch_read(later);
        activity.touch_read(start);
        assert_eq!(activity.read_idle(later), Duration::ZERO);
    }
}
