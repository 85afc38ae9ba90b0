//! axum middleware applying quotas to routes.
//!
//! ```ignore
//! let upload = Router::new()
//!     .route("/upload", post(upload))
//!     .route_layer(from_fn_with_state(gatekeeper.guard("upload"), enforce_quota));
//! ```

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::context::CallerContext;
use super::Gatekeeper;
use crate::ratelimit::GLOBAL_CLASS;

/// Middleware state enforcing one quota class.
#[derive(Clone)]
pub struct QuotaGuard {
    pub(super) gatekeeper: Gatekeeper,
    pub(super) quota_class: Arc<str>,
}

/// Middleware state enforcing the `global` class on all but exempt paths.
#[derive(Clone)]
pub struct GlobalGuard {
    pub(super) gatekeeper: Gatekeeper,
    pub(super) exempt_paths: Arc<[String]>,
}

impl GlobalGuard {
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }
}

/// Run the request only if the caller has quota left in the guarded class.
pub async fn enforce_quota(
    State(guard): State<QuotaGuard>,
    request: Request,
    next: Next,
) -> Response {
    admit_then_run(&guard.gatekeeper, &guard.quota_class, request, next).await
}

/// Run the request only if the caller has global quota left, unless the path
/// is exempt.
pub async fn enforce_global(
    State(guard): State<GlobalGuard>,
    request: Request,
    next: Next,
) -> Response {
    if guard.is_exempt(request.uri().path()) {
        return next.run(request).await;
    }
    admit_then_run(&guard.gatekeeper, GLOBAL_CLASS, request, next).await
}

async fn admit_then_run(
    gatekeeper: &Gatekeeper,
    quota_class: &str,
    request: Request,
    next: Next,
) -> Response {
    let (identifier, tier) = {
        let caller = CallerContext::from_request(&request);
        (caller.identifier(), caller.tier())
    };

    match gatekeeper.admit_identified(&identifier, tier, quota_class).await {
        Ok(_) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}
