//! Quota policies, caller identity and the rate limiter that enforces them.

mod identifier;
mod key;
mod limiter;
mod policy;
mod strategy;

pub use identifier::Identifier;
pub use key::CounterKey;
pub use limiter::{RateLimitResult, RateLimiter};
pub use policy::{QuotaConfig, QuotaPolicyTable, Strategy, Tier, TierQuotas, GLOBAL_CLASS};

/// A limiter over a fresh in-process store where `quota_class` is governed by
/// `config` for both tiers.
#[cfg(test)]
pub(crate) fn test_limiter(quota_class: &str, config: QuotaConfig) -> RateLimiter {
    use std::sync::Arc;

    use crate::store::MemoryStore;

    let table = QuotaPolicyTable::new([
        (GLOBAL_CLASS, TierQuotas::fixed_window(1000, 10000, 3600)),
        (quota_class, TierQuotas::new(config, config)),
    ])
    .expect("test policy table is valid");

    RateLimiter::new(Arc::new(MemoryStore::default()), Arc::new(table))
}
