//! Rate Limiter - per-minute budget with per-key cooldowns
//!
//! Detectors that hit the venue for every trade (hedge checks, conviction
//! checks) share this gate. A check is accepted only when the minute budget has
//! room and the (wallet, market) key is outside its cooldown. Acceptance spends
//! one unit of budget and stamps the key.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

struct LimiterState {
    count: u32,
    window_start: DateTime<Utc>,
    last_check: HashMap<String, DateTime<Utc>>,
}

/// Budget + cooldown gate
pub struct RateLimiter {
    name: &'static str,
    state: Mutex<LimiterState>,
    limits: Mutex<(u32, Duration)>,
}

impl RateLimiter {
    pub fn new(name: &'static str, max_per_minute: u32, cooldown_secs: i64) -> Self {
        Self {
            name,
            state: Mutex::new(LimiterState {
                count: 0,
                window_start: Utc::now(),
                last_check: HashMap::new(),
            }),
            limits: Mutex::new((max_per_minute, Duration::seconds(cooldown_secs.max(0)))),
        }
    }

    /// Swap limits without clearing counters or cooldowns
    pub async fn set_limits(&self, max_per_minute: u32, cooldown_secs: i64) {
        *self.limits.lock().await = (max_per_minute, Duration::seconds(cooldown_secs.max(0)));
    }

    pub async fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Utc::now()).await
    }

    /// Try to spend one check for `key` at `now`. Returns true if accepted.
    pub async fn try_acquire_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let (max_per_minute, cooldown) = *self.limits.lock().await;
        let mut state = self.state.lock().await;

        if now - state.window_start >= Duration::seconds(60) {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= max_per_minute {
            debug!("[{}] minute budget exhausted, skipping {}", self.name, key);
            return false;
        }

        if let Some(last) = state.last_check.get(key) {
            if now - *last < cooldown {
                return false;
            }
        }

        state.count += 1;
        state.last_check.insert(key.to_string(), now);
        true
    }

    /// Start a fresh minute budget
    pub async fn reset_minute(&self) {
        let mut state = self.state.lock().await;
        state.count = 0;
        state.window_start = Utc::now();
    }

    /// Drop cooldown entries that have expired. Returns the number removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let (_, cooldown) = *self.limits.lock().await;
        let mut state = self.state.lock().await;
        let before = state.last_check.len();
        state.last_check.retain(|_, last| now - *last < cooldown);
        before - state.last_check.len()
    }

    /// (checks used this minute, keys under cooldown)
    pub async fn usage(&self) -> (u32, usize) {
        let state = self.state.lock().await;
        (state.count, state.last_check.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooldown_blocks_same_key() {
        let limiter = RateLimiter::new("test", 30, 300);
        let now = Utc::now();
        assert!(limiter.try_acquire_at("0xw:m1", now).await);
        assert!(!limiter.try_acquire_at("0xw:m1", now + Duration::seconds(10)).await);
        // Other keys are unaffected
        assert!(limiter.try_acquire_at("0xw:m2", now + Duration::seconds(10)).await);
        // First check after the cooldown is accepted
        assert!(limiter.try_acquire_at("0xw:m1", now + Duration::seconds(300)).await);
    }

    #[tokio::test]
    async fn test_minute_budget() {
        let limiter = RateLimiter::new("test", 3, 0);
        let now = Utc::now();
        for i in 0..3 {
            assert!(limiter.try_acquire_at(&format!("k{}", i), now).await);
        }
        assert!(!limiter.try_acquire_at("k9", now).await);
        // Budget refills once the minute has elapsed
        assert!(limiter.try_acquire_at("k9", now + Duration::seconds(61)).await);
    }

    #[tokio::test]
    async fn test_rejected_checks_do_not_spend_budget() {
        let limiter = RateLimiter::new("test", 2, 300);
        let now = Utc::now();
        assert!(limiter.try_acquire_at("a", now).await);
        assert!(!limiter.try_acquire_at("a", now).await);
        assert!(!limiter.try_acquire_at("a", now).await);
        assert!(limiter.try_acquire_at("b", now).await);
        assert_eq!(limiter.usage().await.0, 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_cooldowns() {
        let limiter = RateLimiter::new("test", 30, 60);
        let now = Utc::now();
        limiter.try_acquire_at("a", now - Duration::seconds(120)).await;
        limiter.try_acquire_at("b", now).await;
        assert_eq!(limiter.sweep(now).await, 1);
        assert_eq!(limiter.usage().await.1, 1);
    }
}
