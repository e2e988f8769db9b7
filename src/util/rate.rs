use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Windowed byte counter producing a bits-per-second rate.
///
/// Entries older than the window are purged on access. Time pushed in must
/// be monotonically non-decreasing.
#[derive(Debug)]
pub(crate) struct RateCounter {
    history: VecDeque<(Instant, u64)>,
    total: u64,
    window: Duration,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        RateCounter {
            history: VecDeque::new(),
            total: 0,
            window,
        }
    }

    pub fn push(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.history.push_back((now, bytes));
    }

    /// Current rate in bits per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> u32 {
        self.purge_old(now);

        let bits = self.total * 8;
        let rate = bits as f64 / self.window.as_secs_f64();

        rate as u32
    }

    /// Sum of bytes still inside the window. Stale unless `purge_old` ran.
    pub fn sum(&self) -> u64 {
        self.total
    }

    pub fn purge_old(&mut self, now: Instant) {
        while let Some((t, v)) = self.history.front().copied() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.history.pop_front();
            self.total -= v;
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.total = 0;
    }
}
