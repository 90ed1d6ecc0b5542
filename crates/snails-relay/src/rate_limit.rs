//! Sliding-window limiter for signature verification attempts.
//!
//! Keyed by wallet address rather than IP: an address gets at most
//! `max_attempts` verification attempts in any `window`-long span, whether
//! or not the signatures turn out valid.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthRateLimiter {
    attempts: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_attempts: usize,
}

impl AuthRateLimiter {
    pub fn new(window: Duration, max_attempts: usize) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_attempts,
        }
    }

    /// Record an attempt for `address`. Returns `false` when the address
    /// already used up its window; rejected attempts are not recorded.
    pub async fn check(&self, address: &str) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().await;
        let log = attempts.entry(address.to_string()).or_default();

        while let Some(front) = log.front() {
            if now.duration_since(*front) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() >= self.max_attempts {
            warn!(address, attempts = log.len(), "Authentication rate limit exceeded");
            return false;
        }

        log.push_back(now);
        true
    }

    /// Attempts still available to `address` in the current window.
    pub async fn remaining(&self, address: &str) -> usize {
        let now = Instant::now();
        let attempts = self.attempts.lock().await;
        let used = attempts
            .get(address)
            .map(|log| {
                log.iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0);
        self.max_attempts.saturating_sub(used)
    }

    /// Drop addresses whose newest attempt fell out of the window.
    pub async fn purge_stale(&self) {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().await;
        let before = attempts.len();
        attempts.retain(|_, log| {
            log.back()
                .map(|last| now.duration_since(*last) < self.window)
                .unwrap_or(false)
        });
        let removed = before - attempts.len();
        if removed > 0 {
            debug!(removed, "Purged idle authentication windows");
        }
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(snails_shared::constants::AUTH_WINDOW_SECS),
            snails_shared::constants::AUTH_MAX_ATTEMPTS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sixth_attempt_rejected() {
        let limiter = AuthRateLimiter::default();

        for _ in 0..5 {
            assert!(limiter.check("stars1abc").await);
        }
        assert!(!limiter.check("stars1abc").await);
        assert_eq!(limiter.remaining("stars1abc").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_addresses_are_independent() {
        let limiter = AuthRateLimiter::new(Duration::from_secs(300), 1);
        assert!(limiter.check("stars1a").await);
        assert!(!limiter.check("stars1a").await);
        assert!(limiter.check("stars1b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = AuthRateLimiter::new(Duration::from_secs(300), 2);
        assert!(limiter.check("stars1a").await);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(limiter.check("stars1a").await);
        assert!(!limiter.check("stars1a").await);

        // First attempt leaves the window, second one is still inside.
        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(limiter.check("stars1a").await);
        assert!(!limiter.check("stars1a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_stale() {
        let limiter = AuthRateLimiter::new(Duration::from_secs(10), 5);
        assert!(limiter.check("stars1a").await);
        tokio::time::advance(Duration::from_secs(11)).await;
        limiter.purge_stale().await;
        assert!(limiter.attempts.lock().await.is_empty());
    }
}
