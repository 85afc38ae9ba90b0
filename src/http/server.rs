//! HTTP server hosting the decision service.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::{QuotaError, Result};
use crate::ratelimit::RateLimiter;

/// HTTP server for the quota decision service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Paths never subject to the global quota
    exempt_paths: Vec<String>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>, exempt_paths: Vec<String>) -> Self {
        Self {
            addr,
            limiter,
            exempt_paths,
        }
    }

    /// Bind and serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.limiter, &self.exempt_paths);

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server for the quota decision service"
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                QuotaError::Serve(e.to_string())
            })
    }
}
