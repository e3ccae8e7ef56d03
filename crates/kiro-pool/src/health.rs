//! Per-refresh-token health tracking
//!
//! Tracks consecutive refresh failures and applies exponential backoff so a
//! broken token is not retried on every request. Also caches the most
//! recent access token per refresh token for the background refresher.

use std::time::{Duration, Instant};

use time::OffsetDateTime;

/// Backoff is capped at five minutes regardless of failure count.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Access token cached alongside its refresh token.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

/// Health state of one refresh token.
#[derive(Debug, Clone, Default)]
pub struct TokenHealth {
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub cached: Option<CachedToken>,
}

impl TokenHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful refresh, caching the issued token.
    pub fn record_success(&mut self, access_token: String, expires_at: OffsetDateTime) {
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.total_successes += 1;
        self.cached = Some(CachedToken {
            access_token,
            expires_at,
        });
    }

    /// Record a failed refresh.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());
        self.total_failures += 1;
    }

    /// Cooldown after the current failure streak: min(2^n, 300) seconds.
    pub fn cooldown(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        // 2^9 already exceeds the cap, so the exponent is clamped there
        let exponent = self.consecutive_failures.min(9);
        Duration::from_secs(1u64 << exponent).min(MAX_BACKOFF)
    }

    /// Whether the token should be tried: no failures, or the cooldown
    /// since the last failure has elapsed.
    pub fn is_healthy(&self) -> bool {
        match self.last_failure {
            None => true,
            Some(last) => last.elapsed() >= self.cooldown(),
        }
    }

    /// Whether the cached access token is present and not yet expired.
    pub fn has_valid_cached(&self) -> bool {
        self.cached
            .as_ref()
            .is_some_and(|c| OffsetDateTime::now_utc() < c.expires_at)
    }

    /// Whether the cached access token expires within `threshold`.
    pub fn cached_expiring_within(&self, threshold: Duration) -> bool {
        match &self.cached {
            Some(c) => c.expires_at - OffsetDateTime::now_utc() <= threshold,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_health_is_healthy() {
        let health = TokenHealth::new();
        assert!(health.is_healthy());
        assert_eq!(health.cooldown(), Duration::ZERO);
    }

    #[test]
    fn cooldown_grows_exponentially() {
        let mut health = TokenHealth::new();
        health.record_failure();
        assert_eq!(health.cooldown(), Duration::from_secs(2));
        health.record_failure();
        assert_eq!(health.cooldown(), Duration::from_secs(4));
        health.record_failure();
        assert_eq!(health.cooldown(), Duration::from_secs(8));
    }

    #[test]
    fn cooldown_never_exceeds_five_minutes() {
        let mut health = TokenHealth::new();
        for _ in 0..40 {
            health.record_failure();
        }
        assert_eq!(health.cooldown(), Duration::from_secs(300));
    }

    #[test]
    fn failure_then_success_resets_streak() {
        let mut health = TokenHealth::new();
        health.record_failure();
        health.record_failure();
        health.record_success("at".into(), OffsetDateTime::now_utc() + Duration::from_secs(60));
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 2);
        assert_eq!(health.total_successes, 1);
        assert!(health.is_healthy());
    }

    #[test]
    fn recent_failure_is_unhealthy() {
        let mut health = TokenHealth::new();
        health.record_failure();
        assert!(!health.is_healthy());
    }

    #[test]
    fn cached_token_validity() {
        let mut health = TokenHealth::new();
        assert!(!health.has_valid_cached());
        assert!(health.cached_expiring_within(Duration::from_secs(1)));

        health.record_success("at".into(), OffsetDateTime::now_utc() + Duration::from_secs(3600));
        assert!(health.has_valid_cached());
        assert!(!health.cached_expiring_within(Duration::from_secs(600)));
        assert!(health.cached_expiring_within(Duration::from_secs(7200)));
    }

    #[test]
    fn expired_cached_token_is_invalid() {
        let mut health = TokenHealth::new();
        health.record_success("at".into(), OffsetDateTime::now_utc() - Duration::from_secs(1));
        assert!(!health.has_valid_cached());
    }
}
