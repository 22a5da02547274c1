//! Routing table ownership and request dispatch.
//!
//! # Responsibilities
//! - Build a complete [`RoutingTable`] from a [`GatewayConfig`]
//! - Publish it atomically; reject the whole update on any failure
//! - Dispatch requests: robots, dashboard, forward-auth, policy pipeline, 404
//!
//! # Design Decisions
//! - Single writer, many readers: `ArcSwap` instead of a lock
//! - A request keeps the snapshot it loaded for its whole lifetime

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::authorize::{Authorizer, HttpAuthorizer};
use crate::config::GatewayConfig;
use crate::http::{dashboard, forward_auth};
use crate::observability::metrics;
use crate::proxy::pipeline::{BuildError, PipelineBuilder, PipelineContext, RoutePipeline};
use crate::proxy::policy::{Policy, PolicyError};
use crate::proxy::transport::{TransportError, TransportFactory};
use crate::proxy::ProxyError;
use crate::security::headers::remove_identity_headers;
use crate::sessions::{
    CookieOptions, CookieSessionStore, EncryptedJsonCodec, HeaderStore, QueryParamStore,
    SessionCodec, SessionError, SessionLoader, SessionLoaderChain,
};

const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /";

/// Reasons a routing table could not be built.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("cookie secret: {0}")]
    CookieSecret(String),

    #[error("session store: {0}")]
    Session(#[from] SessionError),

    #[error("invalid {field}: {reason}")]
    ServiceUrl { field: &'static str, reason: String },

    #[error("policy #{index}: {source}")]
    Policy {
        index: usize,
        #[source]
        source: PolicyError,
    },

    #[error("policy {route}: {source}")]
    Pipeline {
        route: String,
        #[source]
        source: BuildError,
    },

    #[error("more than one policy for host {0}")]
    DuplicateHost(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("authorization client: {0}")]
    Authorizer(String),
}

/// Immutable snapshot of everything a request is dispatched against.
#[derive(Debug)]
pub struct RoutingTable {
    generation: u64,
    routes: HashMap<String, RoutePipeline>,
    forward_auth_host: Option<String>,
    context: Arc<PipelineContext>,
}

impl RoutingTable {
    /// Build a table from `config`. Nothing is shared with any previous table.
    pub fn build(
        config: &GatewayConfig,
        authorizer: Option<Arc<dyn Authorizer>>,
        generation: u64,
    ) -> Result<Self, TableError> {
        let codec: Arc<dyn SessionCodec> = Arc::new(
            EncryptedJsonCodec::from_base64(&config.session.cookie_secret)
                .map_err(|e| TableError::CookieSecret(e.to_string()))?,
        );

        let cookie_store = Arc::new(CookieSessionStore::new(
            CookieOptions {
                name: config.session.cookie_name.clone(),
                domain: config.session.cookie_domain.clone(),
                secure: config.session.cookie_secure,
                http_only: config.session.cookie_http_only,
                expire: config.session.cookie_expire(),
            },
            Some(codec.clone()),
        )?);

        let loaders: Vec<Arc<dyn SessionLoader>> = vec![
            cookie_store.clone(),
            Arc::new(HeaderStore::new(codec.clone(), config.session.header_scheme.clone())),
            Arc::new(QueryParamStore::new(codec.clone(), config.session.query_param.clone())),
        ];

        let authenticate_url = parse_service_url("authenticate_url", &config.services.authenticate_url)?;

        let authorizer = match authorizer {
            Some(authorizer) => authorizer,
            None => {
                let base = parse_service_url("authorize_url", &config.services.authorize_url)?;
                Arc::new(
                    HttpAuthorizer::new(&base, config.services.shared_secret.clone(), config.timeouts.authorize())
                        .map_err(|e| TableError::Authorizer(e.to_string()))?,
                )
            }
        };

        let forward_auth_host = match &config.services.forward_auth_url {
            Some(raw) => Some(host_key(&parse_service_url("forward_auth_url", raw)?)),
            None => None,
        };

        let context = Arc::new(PipelineContext {
            authenticate_url,
            codec,
            cookie_store,
            loaders: Arc::new(SessionLoaderChain::new(loaders)),
            query_param: config.session.query_param.clone(),
            authorizer,
            authorize_timeout: config.timeouts.authorize(),
            default_timeout: config.timeouts.default_upstream(),
            signing_key: config.signing_key.clone().filter(|k| !k.trim().is_empty()),
            transports: TransportFactory::new(config.timeouts.connect())?,
        });

        if config.policies.is_empty() {
            tracing::warn!("Configuration has no policies");
        }

        let mut routes = HashMap::with_capacity(config.policies.len());
        for (index, policy_config) in config.policies.iter().enumerate() {
            let policy = Policy::from_config(policy_config)
                .map_err(|source| TableError::Policy { index, source })?;
            let host = policy.source_host();
            if routes.contains_key(&host) || forward_auth_host.as_deref() == Some(host.as_str()) {
                return Err(TableError::DuplicateHost(host));
            }

            let pipeline = PipelineBuilder::new(&policy, &context)
                .build()
                .map_err(|source| TableError::Pipeline {
                    route: policy.to_string(),
                    source,
                })?;
            routes.insert(host, pipeline);
        }

        Ok(Self {
            generation,
            routes,
            forward_auth_host,
            context,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Pipeline serving `host`, tolerating an explicit port the policy omits.
    pub fn pipeline(&self, host: &str) -> Option<&RoutePipeline> {
        let host = host.to_ascii_lowercase();
        self.routes.get(&host).or_else(|| {
            let (bare, _port) = host.rsplit_once(':')?;
            self.routes.get(bare)
        })
    }

    /// True if `host` is the forward-auth host, with or without an explicit port.
    pub fn is_forward_auth_host(&self, host: &str) -> bool {
        let Some(expected) = self.forward_auth_host.as_deref() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        host == expected || host.rsplit_once(':').is_some_and(|(bare, _port)| bare == expected)
    }

    /// True if `host` is any host this table serves.
    pub fn serves(&self, host: &str) -> bool {
        self.pipeline(host).is_some() || self.is_forward_auth_host(host)
    }

    async fn route(&self, mut request: Request) -> (Response, &'static str) {
        let host = request_host(&request);
        let path = request.uri().path();

        if request.method() == Method::GET && path == "/robots.txt" {
            return ((StatusCode::OK, ROBOTS_TXT).into_response(), "robots");
        }
        if dashboard::is_dashboard_path(path) {
            return (dashboard::handle(self, request), "dashboard");
        }
        if self.is_forward_auth_host(&host) {
            return (forward_auth::handle(self, request).await, "forward_auth");
        }

        match self.pipeline(&host) {
            Some(pipeline) => {
                remove_identity_headers(request.headers_mut());
                (pipeline.handle(request).await, "policy")
            }
            None => {
                tracing::debug!(host = %host, "No route for host");
                (ProxyError::UnknownRoute { host }.into_response(), "unknown")
            }
        }
    }
}

/// Owns the live routing table.
pub struct RouteAuthority {
    table: ArcSwap<RoutingTable>,
    generation: AtomicU64,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl RouteAuthority {
    /// Build the initial table with an HTTP authorizer from `config`.
    pub fn new(config: &GatewayConfig) -> Result<Self, TableError> {
        Self::build(config, None)
    }

    /// Build with a fixed authorizer used for every table.
    pub fn with_authorizer(config: &GatewayConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self, TableError> {
        Self::build(config, Some(authorizer))
    }

    fn build(config: &GatewayConfig, authorizer: Option<Arc<dyn Authorizer>>) -> Result<Self, TableError> {
        let table = RoutingTable::build(config, authorizer.clone(), 1)?;
        tracing::info!(routes = table.len(), "Routing table built");
        Ok(Self {
            table: ArcSwap::from_pointee(table),
            generation: AtomicU64::new(1),
            authorizer,
        })
    }

    /// Replace the table. On failure the current table stays live.
    pub fn update(&self, config: &GatewayConfig) -> Result<u64, TableError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match RoutingTable::build(config, self.authorizer.clone(), generation) {
            Ok(table) => {
                let routes = table.len();
                self.table.store(Arc::new(table));
                metrics::record_reload("success");
                tracing::info!(generation, routes, "Routing table updated");
                Ok(generation)
            }
            Err(e) => {
                metrics::record_reload("failure");
                tracing::error!(
                    error = %e,
                    live_generation = self.table.load().generation(),
                    "Rejected configuration, keeping current routing table"
                );
                Err(e)
            }
        }
    }

    /// The table requests are currently dispatched against.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let start = Instant::now();
        let method = request.method().clone();
        let table = self.snapshot();

        let (response, route) = table.route(request).await;
        metrics::record_request(method.as_str(), response.status().as_u16(), route, start);
        response
    }
}

impl std::fmt::Debug for RouteAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteAuthority")
            .field("generation", &self.table.load().generation())
            .finish_non_exhaustive()
    }
}

fn parse_service_url(field: &'static str, raw: &str) -> Result<Url, TableError> {
    let url = Url::parse(raw).map_err(|e| TableError::ServiceUrl {
        field,
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(TableError::ServiceUrl {
            field,
            reason: format!("'{}' is not an http(s) url", raw),
        });
    }
    Ok(url)
}

fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Lowercase host of a request, from `Host` or the URI authority.
pub fn request_host(request: &Request) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_ascii_lowercase()
}
