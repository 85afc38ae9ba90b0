//! Quota-checking algorithms.
//!
//! All three strategies deny when the consumed amount has reached the limit
//! (`count == limit` denies). Each check is one atomic store operation for
//! the sliding window and token bucket, and an increment for the fixed
//! window, so concurrent checks never admit more than the limit.

use std::time::Duration;

use tracing::trace;

use super::key::CounterKey;
use super::limiter::{RateLimitResult, RateLimiter};
use super::policy::QuotaConfig;
use crate::store::{BucketSpec, StoreError, TOKEN_EPSILON};

/// Whole seconds needed to cover `secs`, ignoring float noise.
fn ceil_secs(secs: f64) -> u64 {
    (secs - TOKEN_EPSILON).ceil().max(0.0) as u64
}

impl RateLimiter {
    /// Count requests in windows aligned to multiples of the window length.
    ///
    /// A burst straddling a window boundary can admit up to twice the limit
    /// in a short span; that is inherent to the strategy.
    pub(super) async fn fixed_window(
        &self,
        key: &CounterKey,
        config: &QuotaConfig,
        now: Duration,
    ) -> Result<RateLimitResult, StoreError> {
        let now_secs = now.as_secs();
        let window_start = now_secs / config.window_seconds * config.window_seconds;
        let reset_time = window_start + config.window_seconds;
        let storage_key = key.fixed_window(window_start);

        let current = self
            .store
            .get(&storage_key)
            .await?
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        if current >= config.limit {
            return Ok(RateLimitResult::deny(config.limit, reset_time, reset_time - now_secs));
        }

        let count = self.store.increment(&storage_key, 1, config.window()).await?;
        let count = u64::try_from(count).unwrap_or(0);

        // Concurrent checks can all pass the read above; the increment decides.
        if count > config.limit {
            trace!(key = %storage_key, count, "Lost race for the last slot in window");
            return Ok(RateLimitResult::deny(config.limit, reset_time, reset_time - now_secs));
        }

        Ok(RateLimitResult::allow(
            config.limit,
            config.limit.saturating_sub(count),
            reset_time,
        ))
    }

    /// Keep the request timestamps of the trailing window and admit while
    /// fewer than `limit` remain.
    pub(super) async fn sliding_window(
        &self,
        key: &CounterKey,
        config: &QuotaConfig,
        now: Duration,
    ) -> Result<RateLimitResult, StoreError> {
        let now_secs = now.as_secs();
        let storage_key = key.timestamps();

        let log = self
            .store
            .append_within_window(&storage_key, now_secs, config.window_seconds, config.limit)
            .await?;
        let oldest = log.oldest.unwrap_or(now_secs);

        if !log.admitted {
            trace!(key = %storage_key, count = log.count, "Sliding window full");
            let available_at = oldest + config.window_seconds;
            let retry_after = available_at.saturating_sub(now_secs).max(1);
            return Ok(RateLimitResult::deny(
                config.limit,
                available_at.max(now_secs + retry_after),
                retry_after,
            ));
        }

        Ok(RateLimitResult::allow(
            config.limit,
            config.limit.saturating_sub(log.count),
            oldest + config.window_seconds,
        ))
    }

    /// Refill `limit / window` tokens per second up to the bucket capacity and
    /// spend one token per request.
    pub(super) async fn token_bucket(
        &self,
        key: &CounterKey,
        config: &QuotaConfig,
        now: Duration,
    ) -> Result<RateLimitResult, StoreError> {
        let now_secs = now.as_secs();
        let rate = config.refill_rate();
        let shape = BucketSpec {
            capacity: config.capacity() as f64,
            refill_rate: rate,
            ttl: config.window() * 2,
        };
        let storage_key = key.bucket();

        let level = self
            .store
            .take_token(&storage_key, now.as_millis() as u64, &shape)
            .await?;

        if !level.admitted {
            let retry_after = ceil_secs((1.0 - level.tokens) / rate).max(1);
            return Ok(RateLimitResult::deny(
                config.limit,
                now_secs + retry_after,
                retry_after,
            ));
        }

        let until_full = ceil_secs((shape.capacity - level.tokens) / rate);
        Ok(RateLimitResult::allow(
            config.limit,
            (level.tokens + TOKEN_EPSILON).floor() as u64,
            now_secs + until_full,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::identifier::Identifier;
    use crate::ratelimit::policy::Tier;
    use crate::ratelimit::test_limiter;

    const CLASS: &str = "upload";

    fn alice() -> Identifier {
        Identifier::user("alice")
    }

    /// Advance paused time to `offset` before the end of the current
    /// `window`-aligned period, skipping a full period if needed.
    async fn advance_to_window_end(limiter: &RateLimiter, window: u64, offset: Duration) {
        let now = limiter.clock.now();
        let next_boundary = Duration::from_secs((now.as_secs() / window + 2) * window);
        tokio::time::advance(next_boundary - offset - now).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_scenario() {
        let limiter = test_limiter(CLASS, QuotaConfig::fixed_window(3, 60));
        // Start at the top of a window so all four checks share it
        advance_to_window_end(&limiter, 60, Duration::from_secs(60)).await;

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
            assert!(result.allowed);
            assert_eq!(result.retry_after, None);
            remaining.push(result.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let now = limiter.clock.now_secs();
        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let retry_after = denied.retry_after.unwrap();
        assert!((1..=60).contains(&retry_after));
        assert!(denied.reset_time >= now);
        assert_eq!(denied.reset_time, now + retry_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets_in_next_window() {
        let limiter = test_limiter(CLASS, QuotaConfig::fixed_window(2, 60));

        for _ in 0..2 {
            assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        }
        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(!denied.allowed);

        tokio::time::advance(Duration::from_secs(denied.retry_after.unwrap())).await;

        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_admits_double_limit_across_boundary() {
        let limiter = test_limiter(CLASS, QuotaConfig::fixed_window(5, 60));
        advance_to_window_end(&limiter, 60, Duration::from_millis(500)).await;

        let mut allowed = 0;
        for _ in 0..5 {
            if limiter.check(&alice(), CLASS, Tier::Standard).await.allowed {
                allowed += 1;
            }
        }

        // One second later a new window has started
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..6 {
            if limiter.check(&alice(), CLASS, Tier::Standard).await.allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_remaining_never_increases() {
        let limiter = test_limiter(CLASS, QuotaConfig::fixed_window(10, 3600));
        advance_to_window_end(&limiter, 3600, Duration::from_secs(3600)).await;

        let mut previous = u64::MAX;
        for _ in 0..15 {
            let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
            assert!(result.remaining <= previous);
            previous = result.remaining;
            tokio::time::advance(Duration::from_secs(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_malformed_count_is_reset() {
        let limiter = test_limiter(CLASS, QuotaConfig::fixed_window(3, 60));
        advance_to_window_end(&limiter, 60, Duration::from_secs(60)).await;

        let now = limiter.clock.now_secs();
        let storage_key = CounterKey::new(CLASS, &alice()).fixed_window(now / 60 * 60);
        limiter.store.set(&storage_key, "garbage", Duration::from_secs(60)).await.unwrap();

        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_denies_limit_plus_one() {
        let limiter = test_limiter(CLASS, QuotaConfig::sliding_window(3, 60));

        let mut remaining = Vec::new();
        for _ in 0..3 {
            let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
            assert!(result.allowed);
            remaining.push(result.remaining);
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        // Oldest request was 30s ago and leaves the window in another 30s
        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(30));
        assert_eq!(denied.reset_time, limiter.clock.now_secs() + 30);

        tokio::time::advance(Duration::from_secs(30)).await;

        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_has_no_boundary_burst() {
        let limiter = test_limiter(CLASS, QuotaConfig::sliding_window(5, 60));
        advance_to_window_end(&limiter, 60, Duration::from_millis(500)).await;

        let mut allowed = 0;
        for _ in 0..5 {
            if limiter.check(&alice(), CLASS, Tier::Standard).await.allowed {
                allowed += 1;
            }
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..5 {
            if limiter.check(&alice(), CLASS, Tier::Standard).await.allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_retry_after_at_least_one() {
        let limiter = test_limiter(CLASS, QuotaConfig::sliding_window(1, 1));

        assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);

        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_sliding_window_malformed_state_self_heals() {
        let limiter = test_limiter(CLASS, QuotaConfig::sliding_window(3, 60));
        let storage_key = CounterKey::new(CLASS, &alice()).timestamps();
        limiter.store.set(&storage_key, "{not json", Duration::from_secs(60)).await.unwrap();

        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);

        let stored = limiter.store.get(&storage_key).await.unwrap().unwrap();
        let timestamps: Vec<u64> = serde_json::from_str(&stored).unwrap();
        assert_eq!(timestamps.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_remaining_never_increases() {
        let limiter = test_limiter(CLASS, QuotaConfig::sliding_window(10, 3600));

        let mut previous = u64::MAX;
        for _ in 0..15 {
            let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
            assert!(result.remaining <= previous);
            previous = result.remaining;
            tokio::time::advance(Duration::from_secs(10)).await;
        }
        assert_eq!(previous, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_scenario() {
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(5, 5, Some(5)));

        for expected_remaining in [4, 3, 2, 1, 0] {
            let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        assert!(!limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_one_token_per_interval() {
        // 4 tokens per 8 seconds: one token every 2 seconds
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(4, 8, None));

        for _ in 0..4 {
            assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        }
        let denied = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert_eq!(denied.retry_after, Some(2));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        assert!(!limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_above_limit() {
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(2, 10, Some(5)));

        for _ in 0..5 {
            assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        }
        assert!(!limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_never_exceeds_capacity() {
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(3, 3, None));

        assert!(limiter.check(&alice(), CLASS, Tier::Standard).await.allowed);
        tokio::time::advance(Duration::from_secs(5)).await;

        let mut allowed = 0;
        for _ in 0..10 {
            if limiter.check(&alice(), CLASS, Tier::Standard).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_reset_time_is_time_until_full() {
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(5, 5, None));

        let now = limiter.clock.now_secs();
        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert_eq!(result.reset_time, now + 1);
    }

    #[tokio::test]
    async fn test_token_bucket_malformed_state_self_heals() {
        let limiter = test_limiter(CLASS, QuotaConfig::token_bucket(5, 5, None));
        let storage_key = CounterKey::new(CLASS, &alice()).bucket();
        limiter
            .store
            .set(&storage_key, r#"{"tokens":"lots"}"#, Duration::from_secs(10))
            .await
            .unwrap();

        let result = limiter.check(&alice(), CLASS, Tier::Standard).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);

        let stored = limiter.store.get(&storage_key).await.unwrap().unwrap();
        let bucket: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(bucket["tokens"], 4.0);
    }

    #[test]
    fn test_ceil_secs_ignores_float_noise() {
        // 1 token at 10 tokens per hour
        assert_eq!(ceil_secs(1.0 / (10.0 / 3600.0)), 360);
        assert_eq!(ceil_secs(0.2), 1);
        assert_eq!(ceil_secs(0.0), 0);
    }
}
