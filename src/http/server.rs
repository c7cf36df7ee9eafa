//! HTTP server for gated admin routes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admin_rate_limit, rate_limit_status, resolve_api_key_header};
use crate::error::{GateError, Result};
use crate::ratelimit::Gate;

/// Assemble the service router.
///
/// Every route in `admin` is mounted under `/admin` behind the gate.
/// `/admin/rate-limit/status` and `/healthz` bypass it and consume no
/// budget.
pub fn router(gate: Arc<Gate>, admin: Router) -> Router {
    let gated = admin.layer(from_fn_with_state(gate.clone(), admin_rate_limit));

    let admin = Router::new()
        .route("/rate-limit/status", get(rate_limit_status))
        .with_state(gate)
        .merge(gated)
        .layer(from_fn(resolve_api_key_header));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/admin", admin)
}

/// HTTP server in front of the gate.
pub struct GateServer {
    addr: SocketAddr,
    router: Router,
}

impl GateServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind");
            GateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GateError::Io(e)
            })
    }
}
