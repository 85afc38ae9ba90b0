//! Request gatekeeping: classify the caller, consult the limiter, and turn a
//! denial into a 429 response.

mod context;
mod middleware;
mod rejection;

use std::sync::Arc;

use tracing::info;

use crate::ratelimit::{Identifier, RateLimitResult, RateLimiter, Tier};

pub use context::{AuthenticatedCaller, CallerContext};
pub use middleware::{enforce_global, enforce_quota, GlobalGuard, QuotaGuard};
pub use rejection::{Rejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};

/// Admits or rejects requests against a shared [`RateLimiter`].
#[derive(Clone)]
pub struct Gatekeeper {
    limiter: Arc<RateLimiter>,
}

impl Gatekeeper {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Consume one unit of `quota_class` for the caller.
    ///
    /// Store failures admit the request (see [`RateLimiter::check`]).
    pub async fn admit(
        &self,
        caller: &CallerContext<'_>,
        quota_class: &str,
    ) -> Result<RateLimitResult, Rejection> {
        self.admit_identified(&caller.identifier(), caller.tier(), quota_class)
            .await
    }

    pub(crate) async fn admit_identified(
        &self,
        identifier: &Identifier,
        tier: Tier,
        quota_class: &str,
    ) -> Result<RateLimitResult, Rejection> {
        let result = self.limiter.check(identifier, quota_class, tier).await;
        if result.allowed {
            return Ok(result);
        }

        info!(
            identifier = %identifier,
            quota_class = %quota_class,
            tier = %tier,
            retry_after = ?result.retry_after,
            "Rejecting request over quota"
        );
        Err(Rejection::from_result(&result))
    }

    /// Middleware state enforcing `quota_class`, for use with
    /// `axum::middleware::from_fn_with_state(.., enforce_quota)`.
    pub fn guard(&self, quota_class: impl Into<Arc<str>>) -> QuotaGuard {
        QuotaGuard {
            gatekeeper: self.clone(),
            quota_class: quota_class.into(),
        }
    }

    /// Middleware state enforcing the global class on every path outside
    /// `exempt_paths`, for use with `enforce_global`.
    pub fn global_guard<I, S>(&self, exempt_paths: I) -> GlobalGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GlobalGuard {
            gatekeeper: self.clone(),
            exempt_paths: exempt_paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}
