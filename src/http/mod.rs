//! HTTP surface of the quota decision service.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest};
