//! Continuously refilling token bucket.

use {std::time::Duration, tokio::time::Instant};

/// A bucket that refills at `refill_per_minute` tokens per minute, capped at
/// `capacity`. Time is injected so callers control the clock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_minute: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u64, refill_per_minute: u64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_minute: refill_per_minute as f64,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() / 60. * self.refill_per_minute).min(self.capacity);
        self.last_refill = now;
    }

    /// Refills, checks, and debits in one step.
    pub fn try_consume(&mut self, n: u64, now: Instant) -> bool {
        self.refill(now);
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens would be available at the current rate.
    /// `ceil(deficit × 60000 / refill_per_minute)` milliseconds.
    pub fn time_until_available(&mut self, n: u64, now: Instant) -> Duration {
        self.refill(now);
        let deficit = n as f64 - self.tokens;
        if deficit <= 0. {
            return Duration::ZERO;
        }
        if self.refill_per_minute <= 0. {
            // Never refills; treat as an hour so pollers hit their deadline.
            return Duration::from_secs(3600);
        }
        Duration::from_millis((deficit * 60_000. / self.refill_per_minute).ceil() as u64)
    }

    /// Returns tokens to the bucket, e.g. when a downstream acquisition
    /// failed after this bucket was already debited.
    pub fn add_tokens(&mut self, n: u64) {
        self.tokens = (self.tokens + n as f64).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_bucket_consumes_immediately() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 60, now);
        assert!(bucket.try_consume(10, now));
        assert!(!bucket.try_consume(1, now));
    }

    #[tokio::test]
    async fn deficit_wait_is_ceiled() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 60, now);
        assert!(bucket.try_consume(10, now));
        // 3 tokens at 60/min refill: 3 × 60000 / 60 = 3000ms.
        assert_eq!(
            bucket.time_until_available(3, now),
            Duration::from_millis(3000)
        );
        assert_eq!(bucket.time_until_available(0, now), Duration::ZERO);
    }

    #[tokio::test]
    async fn refill_is_continuous_and_capped() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 60, now);
        assert!(bucket.try_consume(10, now));

        let later = now + Duration::from_secs(2);
        assert!(bucket.try_consume(2, later));
        assert!(!bucket.try_consume(1, later));

        let much_later = now + Duration::from_secs(3600);
        assert!(bucket.try_consume(10, much_later));
        assert!(!bucket.try_consume(1, much_later));
    }

    #[tokio::test]
    async fn refund_restores_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(5, 60, now);
        assert!(bucket.try_consume(5, now));
        bucket.add_tokens(2);
        assert!(bucket.try_consume(2, now));
        // Refunds never exceed capacity.
        bucket.add_tokens(100);
        assert!(bucket.try_consume(5, now));
        assert!(!bucket.try_consume(1, now));
    }
}
