//! Core rate limiter implementation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::identifier::Identifier;
use super::key::CounterKey;
use super::policy::{QuotaConfig, QuotaPolicyTable, Strategy, Tier};
use crate::clock::Clock;
use crate::store::{CounterStore, StoreBackend, StoreError};

/// Outcome of a single quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Limit of the policy that was applied
    pub limit: u64,
    /// Requests left before the next denial; never negative
    pub remaining: u64,
    /// Unix time (seconds) at which quota becomes available again
    pub reset_time: u64,
    /// Seconds to wait before retrying; set only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    pub(super) fn allow(limit: u64, remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    pub(super) fn deny(limit: u64, reset_time: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time,
            retry_after: Some(retry_after),
        }
    }

    /// Result used when the counter store cannot be consulted.
    fn fail_open(config: &QuotaConfig, now_secs: u64) -> Self {
        Self::allow(config.limit, config.limit, now_secs + config.window_seconds)
    }
}

/// Enforces the policy table against a counter store.
///
/// The limiter itself holds no mutable state; it is shared across request
/// handlers behind an `Arc`.
pub struct RateLimiter {
    pub(super) store: Arc<dyn CounterStore>,
    pub(super) policies: Arc<QuotaPolicyTable>,
    pub(super) clock: Clock,
}

impl RateLimiter {
    /// Create a rate limiter over `store` enforcing `policies`.
    pub fn new(store: Arc<dyn CounterStore>, policies: Arc<QuotaPolicyTable>) -> Self {
        Self {
            store,
            policies,
            clock: Clock::new(),
        }
    }

    /// Check and consume quota for `identifier` in `quota_class`.
    ///
    /// If the counter store fails, the request is allowed and the failure is
    /// logged at `warn`.
    pub async fn check(
        &self,
        identifier: &Identifier,
        quota_class: &str,
        tier: Tier,
    ) -> RateLimitResult {
        match self.try_check(identifier, quota_class, tier).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    quota_class = %quota_class,
                    tier = %tier,
                    error = %e,
                    "Counter store unavailable, failing open"
                );
                let config = self.policies.lookup(quota_class, tier);
                RateLimitResult::fail_open(config, self.clock.now_secs())
            }
        }
    }

    /// Like [`check`](Self::check), but surfaces store failures instead of
    /// failing open.
    pub async fn try_check(
        &self,
        identifier: &Identifier,
        quota_class: &str,
        tier: Tier,
    ) -> Result<RateLimitResult, StoreError> {
        let config = self.policies.lookup(quota_class, tier);
        let key = CounterKey::new(quota_class, identifier);
        let now = self.clock.now();

        trace!(
            key = %key,
            tier = %tier,
            strategy = %config.strategy,
            limit = config.limit,
            "Checking quota"
        );

        let result = match config.strategy {
            Strategy::FixedWindow => self.fixed_window(&key, config, now).await?,
            Strategy::SlidingWindow => self.sliding_window(&key, config, now).await?,
            Strategy::TokenBucket => self.token_bucket(&key, config, now).await?,
        };

        if !result.allowed {
            debug!(
                key = %key,
                limit = result.limit,
                retry_after = ?result.retry_after,
                "Quota exceeded"
            );
        }

        Ok(result)
    }

    /// Delete every counter kept for `identifier` in `quota_class`.
    ///
    /// Returns whether any state was removed.
    pub async fn reset(&self, identifier: &Identifier, quota_class: &str) -> bool {
        let key = CounterKey::new(quota_class, identifier);
        let quotas = self.policies.quotas(quota_class);
        let now = self.clock.now_secs();

        let mut storage_keys = vec![key.timestamps(), key.bucket()];
        for tier in Tier::ALL {
            let window = quotas.get(tier).window_seconds;
            let fixed = key.fixed_window(now / window * window);
            if !storage_keys.contains(&fixed) {
                storage_keys.push(fixed);
            }
        }

        let mut removed = false;
        for storage_key in &storage_keys {
            match self.store.delete(storage_key).await {
                Ok(deleted) => removed |= deleted,
                Err(e) => warn!(
                    key = %storage_key,
                    error = %e,
                    "Failed to delete counter during reset"
                ),
            }
        }

        info!(identifier = %identifier, quota_class = %quota_class, removed, "Quota reset");
        removed
    }

    /// The policy applied to `quota_class` for `tier`.
    pub fn get_policy(&self, quota_class: &str, tier: Tier) -> QuotaConfig {
        *self.policies.lookup(quota_class, tier)
    }

    /// The policy table this limiter enforces.
    pub fn policies(&self) -> &QuotaPolicyTable {
        &self.policies
    }

    /// The backend holding the counters.
    pub fn backend(&self) -> StoreBackend {
        self.store.backend()
    }
}
