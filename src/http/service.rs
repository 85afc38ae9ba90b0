//! Handlers of the quota decision service.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};

use crate::gatekeeper::{enforce_global, CallerContext, Gatekeeper};
use crate::ratelimit::{Identifier, QuotaConfig, RateLimiter, Tier};
use crate::store::StoreBackend;

/// Largest `/v1/check` body accepted.
const MAX_CHECK_BODY: usize = 16 * 1024;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    limiter: Arc<RateLimiter>,
    gatekeeper: Gatekeeper,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            gatekeeper: Gatekeeper::new(limiter.clone()),
            limiter,
        }
    }
}

/// Build the service router. Every route outside `exempt_paths` first
/// consumes the caller's `global` quota.
pub fn router(limiter: Arc<RateLimiter>, exempt_paths: &[String]) -> Router {
    let state = AppState::new(limiter);
    let global = state.gatekeeper.global_guard(exempt_paths.iter().cloned());

    Router::new()
        .route("/health", get(health))
        .route("/v1/check", post(check))
        .route("/v1/limits/{quota_class}/{identifier}", delete(reset))
        .route("/v1/policies/{quota_class}", get(policy))
        .layer(middleware::from_fn_with_state(global, enforce_global))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: StoreBackend,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.limiter.backend(),
    })
}

/// Body of `POST /v1/check`.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub quota_class: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub premium: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(error: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: error.into() })).into_response()
}

/// Consume one unit of quota for the caller described by the body, or by
/// the request's forwarding headers and peer address when no user is named.
#[instrument(skip_all)]
async fn check(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_CHECK_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Failed to read check request body");
            return bad_request("request body unreadable or too large");
        }
    };
    let Json(body) = match Json::<CheckRequest>::from_bytes(&bytes) {
        Ok(body) => body,
        Err(rejection) => return rejection.into_response(),
    };

    if body.quota_class.is_empty() {
        warn!("Received check request with empty quota class");
        return bad_request("quota_class is required");
    }

    let caller = CallerContext {
        user_id: body.user_id.as_deref(),
        headers: &parts.headers,
        peer_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        premium: body.premium,
    };

    match state.gatekeeper.admit(&caller, &body.quota_class).await {
        Ok(result) => Json(result).into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset: bool,
}

#[instrument(skip(state))]
async fn reset(
    State(state): State<AppState>,
    Path((quota_class, identifier)): Path<(String, String)>,
) -> Response {
    let Some(identifier) = Identifier::parse(&identifier) else {
        return bad_request("identifier must be user:<id> or ip:<address>");
    };

    let reset = state.limiter.reset(&identifier, &quota_class).await;
    Json(ResetResponse { reset }).into_response()
}

#[derive(Debug, Deserialize)]
struct PolicyQuery {
    #[serde(default)]
    tier: Tier,
}

async fn policy(
    State(state): State<AppState>,
    Path(quota_class): Path<String>,
    Query(query): Query<PolicyQuery>,
) -> Json<QuotaConfig> {
    Json(state.limiter.get_policy(&quota_class, query.tier))
}
