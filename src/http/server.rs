//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router whose single fallback hands every request to the authority
//! - Wire up middleware (request ID, tracing, body limit)
//! - Serve plain TCP or TLS with graceful shutdown
//! - Apply configuration updates by rebuilding the routing table
//!
//! # Data Flow
//! ```text
//! connection (TCP or TLS)
//!     → request-id → trace span → body limit
//!     → gateway_handler
//!     → RouteAuthority::dispatch (robots / dashboard / forward-auth / policy / 404)
//!
//! config_updates (mpsc)
//!     → RouteAuthority::update (swap on success, keep old table on failure)
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::net::tls::load_tls_config;
use crate::observability::tracing::request_span;
use crate::proxy::authority::TableError;
use crate::proxy::RouteAuthority;

/// In-flight requests get this long to finish once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    config: GatewayConfig,
    authority: Arc<RouteAuthority>,
}

impl HttpServer {
    /// Create a new HTTP server, building the initial routing table from `config`.
    pub fn new(config: GatewayConfig) -> Result<Self, TableError> {
        let authority = Arc::new(RouteAuthority::new(&config)?);
        Ok(Self::with_authority(config, authority))
    }

    /// Create a server around an existing authority.
    pub fn with_authority(config: GatewayConfig, authority: Arc<RouteAuthority>) -> Self {
        let router = Self::build_router(&config, authority.clone());
        Self {
            router,
            config,
            authority,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GatewayConfig, authority: Arc<RouteAuthority>) -> Router {
        Router::new()
            .fallback(gateway_handler)
            .with_state(authority)
            .layer(
                ServiceBuilder::new()
                    .layer(set_request_id_layer())
                    .layer(TraceLayer::new_for_http().make_span_with(request_span))
                    .layer(propagate_request_id_layer())
                    .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes)),
            )
    }

    pub fn authority(&self) -> &Arc<RouteAuthority> {
        &self.authority
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run the server, accepting connections on the given listener until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;

        let reload_shutdown = shutdown.resubscribe();
        let reloader = tokio::spawn(apply_updates(
            self.authority.clone(),
            config_updates,
            reload_shutdown,
        ));

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        match &self.config.listener.tls {
            Some(tls) => {
                let rustls =
                    load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
                tracing::info!(address = %addr, "HTTPS server starting");

                let handle = axum_server::Handle::new();
                let drain = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    tracing::info!("Shutdown signal received, draining connections");
                    drain.graceful_shutdown(Some(DRAIN_TIMEOUT));
                });

                axum_server::from_tcp_rustls(listener.into_std()?, rustls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
            None => {
                tracing::info!(address = %addr, "HTTP server starting");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        tracing::info!("Shutdown signal received, draining connections");
                    })
                    .await?;
            }
        }

        reloader.abort();
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Every request lands here; the authority decides what serves it.
async fn gateway_handler(State(authority): State<Arc<RouteAuthority>>, request: Request) -> Response {
    authority.dispatch(request).await
}

async fn apply_updates(
    authority: Arc<RouteAuthority>,
    mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(config) = update else { break };
                match authority.update(&config) {
                    Ok(generation) => {
                        tracing::info!(generation, policies = config.policies.len(), "Routing table reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Rejected configuration update, keeping current routing table");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
