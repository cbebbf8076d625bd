//! Local HTTP gateway in front of the backend
//!
//! The gateway listens on a fixed port so the UI never needs to know the
//! backend's ephemeral one. Requests are forwarded as-is to the address
//! published by the readiness channel.

pub mod proxy;

pub use proxy::{CORS_ALLOW_HEADERS, CORS_ALLOW_METHODS, CORS_ALLOW_ORIGIN, apply_cors, forward};

use crate::context::SupervisorContext;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to bind gateway on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Gateway I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared handler state
#[derive(Clone)]
pub struct GatewayState {
    pub context: Arc<SupervisorContext>,
    pub client: reqwest::Client,
}

impl GatewayState {
    pub fn new(context: Arc<SupervisorContext>) -> Result<Self, GatewayError> {
        // Redirects and proxies are the browser's business, not ours
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { context, client })
    }
}

/// Every path and method goes to [`forward`]
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A bound gateway, ready to serve
pub struct Gateway {
    listener: TcpListener,
    router: Router,
}

impl Gateway {
    pub async fn bind(addr: SocketAddr, state: GatewayState) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        Ok(Self {
            listener,
            router: router(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(%addr, "Gateway listening");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!(%addr, "Gateway stopped");
        Ok(())
    }
}
