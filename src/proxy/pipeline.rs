//! Per-policy request pipelines.
//!
//! # Responsibilities
//! - Decide which stages a policy gets, in a fixed order
//! - Compose the stages as axum middleware around the forwarder
//! - Reject the policy if any stage cannot be built
//!
//! # Data Flow
//! ```text
//! Timeout (unless websockets)
//!     → CORS preflight bypass (optional, straight to forwarder)
//!     → [public routes stop adding stages here]
//!     → retrieve session → strip session tokens → authenticate → authorize
//!     → sign assertion (optional) → set request headers (optional)
//!     → forwarder
//! ```
//!
//! # Design Decisions
//! - Built once per configuration load; the result is immutable
//! - Authentication and authorization failures never reach the upstream

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;
use url::Url;

use crate::authorize::{Authorizer, RouteRequest};
use crate::observability::metrics;
use crate::proxy::forward::{forward_handler, Forwarder};
use crate::proxy::policy::Policy;
use crate::proxy::transport::{TransportError, TransportFactory};
use crate::proxy::ProxyError;
use crate::security::headers::{EMAIL_HEADER, GROUPS_HEADER, USER_ID_HEADER};
use crate::security::signer::{SignerError, ASSERTION_HEADER};
use crate::security::Signer;
use crate::sessions::{CookieSessionStore, SessionCodec, SessionError, SessionLoaderChain, SessionState};

/// Path on the authenticate service that starts a sign-in.
pub const SIGN_IN_PATH: &str = "/.gatehouse/sign_in";

/// One step of a route pipeline, listed in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Timeout(Duration),
    CorsPreflightBypass,
    RetrieveSession,
    StripSessionCookies,
    Authenticate,
    Authorize,
    SignAssertion,
    SetRequestHeaders,
    Forward,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("signing key: {0}")]
    Signer(#[from] SignerError),
}

/// Shared collaborators every pipeline of one table is built from.
pub struct PipelineContext {
    pub authenticate_url: Url,
    pub codec: Arc<dyn SessionCodec>,
    pub cookie_store: Arc<CookieSessionStore>,
    pub loaders: Arc<SessionLoaderChain>,
    /// Query parameter carrying a session token, also read by the sign-in callback.
    pub query_param: String,
    pub authorizer: Arc<dyn Authorizer>,
    pub authorize_timeout: Duration,
    pub default_timeout: Duration,
    pub signing_key: Option<String>,
    pub transports: TransportFactory,
}

impl PipelineContext {
    /// Sign-in URL on the authenticate service, without a redirect target.
    pub fn sign_in_url(&self) -> Url {
        let mut url = self.authenticate_url.clone();
        url.set_path(SIGN_IN_PATH);
        url.set_query(None);
        url
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("authenticate_url", &self.authenticate_url.as_str())
            .field("authorizer", &self.authorizer)
            .field("default_timeout", &self.default_timeout)
            .field("signing", &self.signing_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of the session loader chain, carried between stages.
#[derive(Debug, Clone)]
pub struct SessionLookup(pub Result<SessionState, SessionError>);

/// A compiled, immutable pipeline for one policy.
#[derive(Clone)]
pub struct RoutePipeline {
    policy: Arc<Policy>,
    stages: Arc<[Stage]>,
    service: Router,
}

impl RoutePipeline {
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub async fn handle(&self, request: Request) -> Response {
        match self.service.clone().oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }
}

impl std::fmt::Debug for RoutePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePipeline")
            .field("policy", &self.policy.to_string())
            .field("stages", &self.stages)
            .finish()
    }
}

/// Builds the pipeline of one policy.
pub struct PipelineBuilder<'a> {
    policy: &'a Policy,
    context: &'a PipelineContext,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(policy: &'a Policy, context: &'a PipelineContext) -> Self {
        Self { policy, context }
    }

    /// Stages this policy gets, outermost first.
    pub fn plan(&self) -> Vec<Stage> {
        let policy = self.policy;
        let mut stages = Vec::new();

        if !policy.allow_websockets {
            let timeout = policy.upstream_timeout.unwrap_or(self.context.default_timeout);
            stages.push(Stage::Timeout(timeout));
        }
        if policy.cors_allow_preflight {
            stages.push(Stage::CorsPreflightBypass);
        }
        if !policy.allow_public_unauthenticated_access {
            stages.extend([
                Stage::RetrieveSession,
                Stage::StripSessionCookies,
                Stage::Authenticate,
                Stage::Authorize,
            ]);
            if self.context.signing_key.is_some() {
                stages.push(Stage::SignAssertion);
            }
            if !policy.set_request_headers.is_empty() {
                stages.push(Stage::SetRequestHeaders);
            }
        }
        stages.push(Stage::Forward);
        stages
    }

    pub fn build(self) -> Result<RoutePipeline, BuildError> {
        let policy = self.policy;
        let context = self.context;
        let stages = self.plan();

        let transport = context.transports.for_policy(policy)?;
        let forwarder = Forwarder::new(policy, transport);

        let signer = match (&context.signing_key, stages.contains(&Stage::SignAssertion)) {
            (Some(key), true) => Some(Arc::new(Signer::new(key, policy.destination_host())?)),
            _ => None,
        };

        if policy.cors_allow_preflight {
            tracing::warn!(route = %policy, "CORS preflight bypass enabled");
        }
        if policy.allow_public_unauthenticated_access {
            tracing::warn!(route = %policy, "All access control disabled for route");
        }
        if stages.contains(&Stage::SetRequestHeaders) {
            tracing::warn!(
                route = %policy,
                headers = ?policy.set_request_headers,
                "Setting static request headers"
            );
        }

        let mut router = Router::new()
            .fallback(forward_handler)
            .with_state(forwarder.clone());

        for stage in stages.iter().rev() {
            router = match *stage {
                Stage::Forward => router,
                Stage::SetRequestHeaders => router.layer(from_fn_with_state(
                    Arc::new(policy.set_request_headers.clone()),
                    set_request_headers,
                )),
                Stage::SignAssertion => match &signer {
                    Some(signer) => router.layer(from_fn_with_state(signer.clone(), sign_assertion)),
                    None => router,
                },
                Stage::Authorize => router.layer(from_fn_with_state(
                    AuthorizeStage {
                        authorizer: context.authorizer.clone(),
                        timeout: context.authorize_timeout,
                        route_host: Arc::from(policy.source_host()),
                    },
                    authorize_session,
                )),
                Stage::Authenticate => router.layer(from_fn_with_state(
                    AuthenticateStage {
                        sign_in_url: Arc::new(context.sign_in_url()),
                        source_host: Arc::from(policy.source_host()),
                        source_proto: Arc::from(policy.source.scheme()),
                    },
                    authenticate_session,
                )),
                Stage::StripSessionCookies => router.layer(from_fn_with_state(
                    context.loaders.clone(),
                    strip_session_tokens,
                )),
                Stage::RetrieveSession => router.layer(from_fn_with_state(
                    context.loaders.clone(),
                    retrieve_session,
                )),
                Stage::CorsPreflightBypass => {
                    router.layer(from_fn_with_state(forwarder.clone(), cors_preflight_bypass))
                }
                Stage::Timeout(timeout) => router.layer(from_fn_with_state(
                    TimeoutStage {
                        destination: Arc::from(policy.destination_host()),
                        timeout,
                    },
                    enforce_timeout,
                )),
            };
        }

        tracing::debug!(route = %policy, stages = ?stages, "Built route pipeline");

        Ok(RoutePipeline {
            policy: Arc::new(policy.clone()),
            stages: stages.into(),
            service: router,
        })
    }
}

#[derive(Clone)]
struct TimeoutStage {
    destination: Arc<str>,
    timeout: Duration,
}

async fn enforce_timeout(State(stage): State<TimeoutStage>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(stage.timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(
                destination = %stage.destination,
                timeout = ?stage.timeout,
                "Upstream timed out"
            );
            ProxyError::UpstreamTimeout {
                host: stage.destination.to_string(),
                timeout: stage.timeout,
            }
            .into_response()
        }
    }
}

/// `OPTIONS` carrying both `Origin` and `Access-Control-Request-Method`.
pub fn is_cors_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && headers.contains_key(header::ORIGIN)
        && headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

async fn cors_preflight_bypass(State(forwarder): State<Forwarder>, request: Request, next: Next) -> Response {
    if is_cors_preflight(request.method(), request.headers()) {
        tracing::debug!(destination = %forwarder.destination(), "CORS preflight bypassing access control");
        return forwarder.forward(request).await;
    }
    next.run(request).await
}

async fn retrieve_session(
    State(loaders): State<Arc<SessionLoaderChain>>,
    mut request: Request,
    next: Next,
) -> Response {
    let lookup = loaders.load(request.headers(), request.uri());
    request.extensions_mut().insert(SessionLookup(lookup));
    next.run(request).await
}

/// Session cookies, a session-scheme `Authorization` and the token query
/// parameter never reach the upstream.
async fn strip_session_tokens(
    State(loaders): State<Arc<SessionLoaderChain>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    loaders.strip(&mut parts.headers, &mut parts.uri);
    next.run(Request::from_parts(parts, body)).await
}

#[derive(Clone)]
struct AuthenticateStage {
    sign_in_url: Arc<Url>,
    source_host: Arc<str>,
    source_proto: Arc<str>,
}

impl AuthenticateStage {
    fn redirect(&self, request: &Request) -> Response {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.source_host);
        let path_and_query = request.uri().path_and_query().map_or("/", |p| p.as_str());
        let original = format!("{}://{}{}", self.source_proto, host, path_and_query);

        let mut location = self.sign_in_url.as_ref().clone();
        location.query_pairs_mut().append_pair("redirect_uri", &original);
        (StatusCode::FOUND, [(header::LOCATION, location.as_str())]).into_response()
    }
}

async fn authenticate_session(
    State(stage): State<AuthenticateStage>,
    mut request: Request,
    next: Next,
) -> Response {
    let state = match request.extensions_mut().remove::<SessionLookup>() {
        Some(SessionLookup(Ok(state))) => state,
        Some(SessionLookup(Err(SessionError::NoSession))) | None => {
            return stage.redirect(&request);
        }
        Some(SessionLookup(Err(e))) => {
            tracing::info!(error = %e, "Rejected session, redirecting to sign in");
            return stage.redirect(&request);
        }
    };

    set_identity_headers(request.headers_mut(), &state);
    request.extensions_mut().insert(state);
    next.run(request).await
}

/// Write the identity headers upstreams rely on.
pub fn set_identity_headers(headers: &mut HeaderMap, state: &SessionState) {
    let values = [
        (USER_ID_HEADER, state.user_id().to_string()),
        (EMAIL_HEADER, state.email.clone()),
        (GROUPS_HEADER, state.groups.join(",")),
    ];
    for (name, value) in values {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = name, "Identity value is not a valid header"),
        }
    }
}

#[derive(Clone)]
struct AuthorizeStage {
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
    route_host: Arc<str>,
}

async fn authorize_session(State(stage): State<AuthorizeStage>, request: Request, next: Next) -> Response {
    let Some(state) = request.extensions().get::<SessionState>() else {
        return ProxyError::Forbidden.into_response();
    };
    let route = RouteRequest::new(request.method(), &stage.route_host, request.uri());

    let verdict = tokio::time::timeout(stage.timeout, stage.authorizer.authorize(state, &route)).await;
    let user = state.user_id().to_string();

    match verdict {
        Ok(Ok(decision)) if decision.allow => {
            metrics::record_authorization("allow");
            next.run(request).await
        }
        Ok(Ok(decision)) => {
            metrics::record_authorization("deny");
            tracing::info!(
                user = %user,
                host = %route.host,
                path = %route.path,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Access denied"
            );
            ProxyError::Forbidden.into_response()
        }
        Ok(Err(e)) => {
            metrics::record_authorization("error");
            tracing::warn!(user = %user, host = %route.host, error = %e, "Authorization failed");
            ProxyError::Forbidden.into_response()
        }
        Err(_) => {
            metrics::record_authorization("error");
            tracing::warn!(
                user = %user,
                host = %route.host,
                timeout = ?stage.timeout,
                "Authorization timed out"
            );
            ProxyError::Forbidden.into_response()
        }
    }
}

async fn sign_assertion(State(signer): State<Arc<Signer>>, mut request: Request, next: Next) -> Response {
    let signed = match request.extensions().get::<SessionState>() {
        Some(state) => signer.sign(state),
        None => return ProxyError::Forbidden.into_response(),
    };

    let assertion = match signed {
        Ok(token) => HeaderValue::from_str(&token).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match assertion {
        Ok(value) => {
            request.headers_mut().insert(ASSERTION_HEADER, value);
            next.run(request).await
        }
        Err(e) => {
            tracing::error!(audience = %signer.audience(), error = %e, "Failed to sign identity assertion");
            ProxyError::Signing.into_response()
        }
    }
}

async fn set_request_headers(
    State(headers): State<Arc<HeaderMap>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    for (name, value) in headers.iter() {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    next.run(request).await
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::routing::get;
    use axum::Json;

    use super::*;
    use crate::authorize::{AuthorizeError, Decision};
    use crate::sessions::codec::generate_key;
    use crate::sessions::{CookieOptions, EncryptedJsonCodec, HeaderStore, QueryParamStore, SessionLoader};

    /// Authorizer returning a fixed verdict.
    #[derive(Debug)]
    pub struct StaticAuthorizer(pub bool);

    #[async_trait]
    impl Authorizer for StaticAuthorizer {
        async fn authorize(
            &self,
            _identity: &SessionState,
            _route: &RouteRequest,
        ) -> Result<Decision, AuthorizeError> {
            Ok(if self.0 {
                Decision::allow()
            } else {
                Decision::deny("not in group")
            })
        }
    }

    /// Authorizer whose service is unreachable.
    #[derive(Debug)]
    pub struct FailingAuthorizer;

    #[async_trait]
    impl Authorizer for FailingAuthorizer {
        async fn authorize(
            &self,
            _identity: &SessionState,
            _route: &RouteRequest,
        ) -> Result<Decision, AuthorizeError> {
            Err(AuthorizeError::Transport("connection refused".into()))
        }
    }

    /// Authorizer that allows after the given delay.
    #[derive(Debug)]
    pub struct SlowAuthorizer(pub Duration);

    #[async_trait]
    impl Authorizer for SlowAuthorizer {
        async fn authorize(
            &self,
            _identity: &SessionState,
            _route: &RouteRequest,
        ) -> Result<Decision, AuthorizeError> {
            tokio::time::sleep(self.0).await;
            Ok(Decision::allow())
        }
    }

    /// Upstream echoing the request URI and headers as JSON; `/slow` sleeps first.
    pub async fn spawn_upstream() -> SocketAddr {
        async fn echo(uri: axum::http::Uri, headers: HeaderMap) -> Json<BTreeMap<String, String>> {
            let mut seen: BTreeMap<String, String> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect();
            seen.insert("uri".into(), uri.to_string());
            Json(seen)
        }

        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    "slow"
                }),
            )
            .fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Upstream that only counts the requests reaching it.
    pub async fn spawn_counting_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().fallback(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    pub fn context(authorizer: Arc<dyn Authorizer>) -> PipelineContext {
        let codec: Arc<dyn SessionCodec> = Arc::new(EncryptedJsonCodec::new(&generate_key()).unwrap());
        let store = Arc::new(
            CookieSessionStore::new(
                CookieOptions {
                    name: "_gatehouse".into(),
                    domain: String::new(),
                    secure: true,
                    http_only: true,
                    expire: Duration::from_secs(3600),
                },
                Some(codec.clone()),
            )
            .unwrap(),
        );
        let loaders: Vec<Arc<dyn SessionLoader>> = vec![
            store.clone(),
            Arc::new(HeaderStore::new(codec.clone(), "Gatehouse")),
            Arc::new(QueryParamStore::new(codec.clone(), "gatehouse_session")),
        ];
        PipelineContext {
            authenticate_url: Url::parse("https://auth.example.com").unwrap(),
            codec,
            cookie_store: store,
            loaders: Arc::new(SessionLoaderChain::new(loaders)),
            query_param: "gatehouse_session".into(),
            authorizer,
            authorize_timeout: Duration::from_secs(1),
            default_timeout: Duration::from_secs(5),
            signing_key: None,
            transports: TransportFactory::new(Duration::from_secs(1)).unwrap(),
        }
    }

    pub fn alice() -> SessionState {
        SessionState {
            sub: "sub-alice".into(),
            user: "alice".into(),
            email: "alice@example.com".into(),
            groups: vec!["eng".into(), "ops".into()],
            ..Default::default()
        }
    }

    /// `Cookie` header value carrying `state` for `store`.
    pub fn session_cookie(store: &CookieSessionStore, state: &SessionState) -> String {
        let mut response = HeaderMap::new();
        store.save_session(&mut response, &HeaderMap::new(), state).unwrap();
        response
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
