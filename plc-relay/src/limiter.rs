use std::time::Instant;

/// Token-bucket admission control.
///
/// The bucket holds one second worth of tokens and starts full, so a fresh
/// limiter admits a burst of `rate` packets before throttling to `rate` per
/// second. A rate of 0 disables limiting.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: u32,
    bucket_size: f64,
    tokens: f64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        Self::new_at(rate, Instant::now())
    }

    pub fn new_at(rate: u32, now: Instant) -> Self {
        Self {
            rate,
            bucket_size: f64::from(rate),
            tokens: f64::from(rate),
            last_update: now,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Current fill level of the bucket.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Refill for the time elapsed since the last call, then try to spend one
    /// token.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        if self.rate == 0 {
            return true;
        }

        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * f64::from(self.rate)).min(self.bucket_size);
        if now > self.last_update {
            self.last_update = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
