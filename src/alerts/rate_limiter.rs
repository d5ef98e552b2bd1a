use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Sliding one-minute cap on outbound alert deliveries.
///
/// Shared by all targets so an incident that takes down many endpoints at
/// once cannot flood the gateway.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_minute: usize,
    recent: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    /// A limit of zero disables limiting.
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            recent: VecDeque::new(),
        }
    }

    /// Take a delivery slot if one is free.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Utc::now())
    }

    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.max_per_minute == 0 {
            return true;
        }
        self.cleanup(now);
        if self.recent.len() >= self.max_per_minute {
            return false;
        }
        self.recent.push_back(now);
        true
    }

    pub fn current_count(&mut self) -> usize {
        self.cleanup(Utc::now());
        self.recent.len()
    }

    fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(1);
        self.recent.retain(|&t| t > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_within_limit() {
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_count(), 3);
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateLimiter::new(2);
        let now = Utc::now();

        assert!(limiter.try_acquire_at(now - Duration::seconds(90)));
        assert!(limiter.try_acquire_at(now - Duration::seconds(30)));
        // The 90s-old slot has expired.
        assert!(limiter.try_acquire_at(now));
        assert!(!limiter.try_acquire_at(now));
    }

    #[test]
    fn test_zero_disables_limit() {
        let mut limiter = RateLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
    }
}
