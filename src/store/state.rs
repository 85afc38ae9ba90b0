//! Stored state of the sliding window and token bucket, and the single-step
//! transitions applied to it.
//!
//! Both backends apply these transitions atomically: the in-process store
//! under its lock, Redis in a server-side script that mirrors this code.
//! State that fails to parse is treated as absent and overwritten by the next
//! admitted request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Slack for float rounding in token arithmetic.
pub const TOKEN_EPSILON: f64 = 1e-9;

/// Result of trying to append a request timestamp to a window log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLog {
    /// Whether the timestamp was appended
    pub admitted: bool,
    /// Timestamps inside the window, including the appended one
    pub count: u64,
    /// Oldest timestamp inside the window
    pub oldest: Option<u64>,
}

/// Shape of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum tokens held
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Expiry of the stored bucket
    pub ttl: Duration,
}

/// Result of trying to take one token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLevel {
    /// Whether a token was taken
    pub admitted: bool,
    /// Tokens left after the attempt
    pub tokens: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct BucketState {
    pub tokens: f64,
    /// Unix time of the last refill, in milliseconds
    pub last_refill: u64,
}

/// Drop timestamps at or before `now - window` and append `now` if fewer than
/// `limit` remain. Returns the new encoded log when it was appended.
pub(crate) fn append_timestamp(
    raw: Option<&str>,
    now: u64,
    window: u64,
    limit: u64,
) -> (WindowLog, Option<String>) {
    let horizon = now.saturating_sub(window);
    let mut timestamps: Vec<u64> = raw
        .and_then(|r| serde_json::from_str(r).ok())
        .unwrap_or_default();
    timestamps.retain(|&ts| ts > horizon);
    timestamps.sort_unstable();

    if timestamps.len() as u64 >= limit {
        let log = WindowLog {
            admitted: false,
            count: timestamps.len() as u64,
            oldest: timestamps.first().copied(),
        };
        return (log, None);
    }

    timestamps.push(now);
    let log = WindowLog {
        admitted: true,
        count: timestamps.len() as u64,
        oldest: timestamps.first().copied(),
    };
    (log, serde_json::to_string(&timestamps).ok())
}

pub(crate) fn decode_bucket(raw: Option<&str>) -> Option<BucketState> {
    raw.and_then(|r| serde_json::from_str::<BucketState>(r).ok())
        .filter(|state| state.tokens.is_finite() && state.tokens >= 0.0)
}

/// Refill the bucket up to `now_ms` and take one token if a whole one is
/// available. Returns the new encoded bucket when a token was taken.
pub(crate) fn take_token(
    raw: Option<&str>,
    now_ms: u64,
    shape: &BucketSpec,
) -> (BucketLevel, Option<String>) {
    let state = decode_bucket(raw).unwrap_or(BucketState {
        tokens: shape.capacity,
        last_refill: now_ms,
    });

    let elapsed = now_ms.saturating_sub(state.last_refill) as f64 / 1000.0;
    let tokens = (state.tokens + elapsed * shape.refill_rate).min(shape.capacity);

    if tokens + TOKEN_EPSILON < 1.0 {
        let level = BucketLevel {
            admitted: false,
            tokens,
        };
        return (level, None);
    }

    let next = BucketState {
        tokens: (tokens - 1.0).max(0.0),
        last_refill: now_ms,
    };
    let level = BucketLevel {
        admitted: true,
        tokens: next.tokens,
    };
    (level, serde_json::to_string(&next).ok())
}
