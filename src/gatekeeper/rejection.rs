//! The 429 response sent to callers over quota.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::RateLimitResult;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A denied quota check, rendered as `429 Too Many Requests`.
///
/// Carries only what the caller needs to back off; store details never
/// reach the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub limit: u64,
    pub reset_time: u64,
    pub retry_after: u64,
}

#[derive(Serialize)]
struct RejectionBody {
    error: &'static str,
    retry_after: u64,
    reset_time: u64,
}

impl Rejection {
    pub fn from_result(result: &RateLimitResult) -> Self {
        Self {
            limit: result.limit,
            reset_time: result.reset_time,
            retry_after: result.retry_after.unwrap_or(1),
        }
    }

    /// The wire headers of a denial.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_time));
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(self.retry_after));
        headers
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: "rate limit exceeded",
            retry_after: self.retry_after,
            reset_time: self.reset_time,
        };

        (StatusCode::TOO_MANY_REQUESTS, self.headers(), Json(body)).into_response()
    }
}
