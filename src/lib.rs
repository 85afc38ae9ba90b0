//! Quotaguard - Per-caller API Quota Enforcement
//!
//! This crate decides whether a caller may proceed with a request under a
//! named quota class. Counters live in Redis when it is reachable and in a
//! bounded in-process store otherwise; three strategies (fixed window,
//! sliding window, token bucket) are available per class and tier.

pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod http;
pub mod ratelimit;
pub mod store;
