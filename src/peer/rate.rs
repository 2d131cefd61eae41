use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Interval transfer-rate counter.
///
/// Message handlers record byte counts; the choking controller calls `tick` once per
/// choke interval, which drains the window into a bytes-per-second figure. Everything
/// is a single-word atomic so readers never contend with the hot receive path.
#[derive(Debug, Default)]
pub struct RateCounter {
    window_bytes: AtomicU64,
    total_bytes: AtomicU64,
    /// Bytes per second over the last completed interval.
    last_rate: AtomicU64,
}

impl RateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` transferred bytes.
    pub fn record(&self, n: usize) {
        self.window_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Closes the current interval: converts the window into bytes/second, resets it,
    /// and returns the rate.
    pub fn tick(&self, interval: Duration) -> u64 {
        let bytes = self.window_bytes.swap(0, Ordering::AcqRel);
        let secs = interval.as_secs_f64().max(f64::MIN_POSITIVE);
        let rate = (bytes as f64 / secs) as u64;
        self.last_rate.store(rate, Ordering::Release);
        rate
    }

    /// The rate computed by the most recent `tick`, in bytes per second.
    pub fn rate(&self) -> u64 {
        self.last_rate.load(Ordering::Acquire)
    }

    /// Total bytes recorded over the connection's lifetime.
    pub fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
