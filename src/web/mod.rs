//! Prometheus exporter.

mod handlers;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::output::SharedRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
}

/// HTTP server exposing the gauge registry.
pub struct Server {
    listen: SocketAddr,
    state: AppState,
}

impl Server {
    pub fn new(listen: SocketAddr, registry: SharedRegistry) -> Self {
        Self {
            listen,
            state: AppState { registry },
        }
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/", get(handlers::handle_metrics))
            .route("/metrics", get(handlers::handle_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = self.routes();
        let listener = tokio::net::TcpListener::bind(self.listen).await?;

        tracing::info!("prometheus exporter listening on {}", self.listen);
        axum::serve(listener, router).await?;

        Ok(())
    }
}
