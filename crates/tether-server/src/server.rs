use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tether_telemetry::LogContext;
use tether_upstream::CompletionGateway;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::auth::AuthGate;
use crate::catalog::ModelCatalog;
use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            request_body_limit: 4 * 1024 * 1024,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<CompletionGateway>,
    pub auth: Arc<dyn AuthGate>,
    pub catalog: Arc<ModelCatalog>,
    pub span: Span,
}

impl AppState {
    pub fn new(
        gateway: Arc<CompletionGateway>,
        auth: Arc<dyn AuthGate>,
        catalog: ModelCatalog,
        log: &LogContext,
    ) -> Self {
        Self {
            gateway,
            auth,
            catalog: Arc::new(catalog),
            span: log.component("http"),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle for graceful shutdown.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let span = state.span.clone();
    let router = build_router(state, config.request_body_limit);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    tracing::info!(parent: &span, %addr, "HTTP server listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(parent: &span, error = %e, "HTTP server error");
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`; keeps the serve task alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.server).await;
    }
}
