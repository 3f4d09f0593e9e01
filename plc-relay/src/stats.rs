use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default sliding window: 60 samples, 60 seconds.
pub const DEFAULT_WINDOW_SIZE: usize = 60;

/// Packet counters plus a sliding window of recent arrival times.
///
/// Counters are plain atomics so the metrics listener can read them while the
/// capture thread writes. `rate_limited`, `oversized` and `errors` are bumped
/// by the pipeline at the drop site in addition to `record_packet(false, ..)`,
/// so each of them is a subset of `dropped`.
pub struct PacketStats {
    window_size: usize,
    pub processed: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub rate_limited: AtomicU64,
    pub oversized: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    recent: Mutex<VecDeque<Instant>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub rate_limited: u64,
    pub oversized: u64,
    pub errors: u64,
    pub bytes_forwarded: u64,
    pub current_rate: f64,
}

impl Default for PacketStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl PacketStats {
    /// `window_size` is both the sample capacity and the age limit in seconds.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            processed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(window_size + 1)),
        }
    }

    pub fn record_packet(&self, forwarded: bool, size: usize) {
        self.record_packet_at(forwarded, size, Instant::now());
    }

    pub fn record_packet_at(&self, forwarded: bool, size: usize, now: Instant) {
        self.processed.fetch_add(1, Ordering::Relaxed);

        {
            let mut recent = self.window();
            recent.push_back(now);
            while recent.len() > self.window_size {
                recent.pop_front();
            }
        }

        if forwarded {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
            self.bytes_forwarded
                .fetch_add(size as u64, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate_at(Instant::now())
    }

    /// Packets per second over the span actually covered by the window.
    ///
    /// Samples older than `window_size` seconds are evicted first. The rate is
    /// the number of inter-arrival intervals divided by the time from the
    /// oldest remaining sample to `now`.
    pub fn current_rate_at(&self, now: Instant) -> f64 {
        let max_age = Duration::from_secs(self.window_size as u64);
        let mut recent = self.window();

        while let Some(oldest) = recent.front() {
            if now.saturating_duration_since(*oldest) > max_age {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() < 2 {
            return 0.0;
        }

        let span = recent
            .front()
            .map(|oldest| now.saturating_duration_since(*oldest).as_secs_f64())
            .unwrap_or(0.0);
        if span > 0.0 {
            (recent.len() - 1) as f64 / span
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            current_rate: self.current_rate(),
        }
    }

    /// Emit a one-line summary of every counter and the current rate.
    pub fn log_stats(&self) {
        let s = self.snapshot();
        tracing::info!(
            processed = s.processed,
            forwarded = s.forwarded,
            dropped = s.dropped,
            rate_limited = s.rate_limited,
            oversized = s.oversized,
            errors = s.errors,
            bytes_forwarded = s.bytes_forwarded,
            "Stats - Processed: {}, Forwarded: {}, Dropped: {}, Rate Limited: {}, Oversized: {}, Errors: {}, Current Rate: {:.2} pps",
            s.processed,
            s.forwarded,
            s.dropped,
            s.rate_limited,
            s.oversized,
            s.errors,
            s.current_rate,
        );
    }

    // A panic while holding the lock cannot leave the deque inconsistent, so a
    // poisoned lock is still usable.
    fn window(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }
}
