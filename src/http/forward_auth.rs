//! Forward-auth verification endpoint.
//!
//! Lets a third-party proxy (nginx `auth_request`, traefik `forwardAuth`)
//! delegate the access decision for a URL to the gateway.
//!
//! ```text
//! GET https://{forward_auth_host}/verify?uri=https://app.example.com/path
//!     200 + identity headers   allowed (or public route)
//!     401                      no valid session
//!     403                      denied, or authorization failed
//!     404                      no policy for the uri's host
//! ```

use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::authorize::RouteRequest;
use crate::observability::metrics;
use crate::proxy::pipeline::set_identity_headers;
use crate::proxy::{ProxyError, RoutingTable};

pub const VERIFY_PATH: &str = "/verify";

const X_FORWARDED_METHOD: HeaderName = HeaderName::from_static("x-forwarded-method");

pub async fn handle(table: &RoutingTable, request: Request) -> Response {
    if request.method() != Method::GET || request.uri().path() != VERIFY_PATH {
        return StatusCode::NOT_FOUND.into_response();
    }

    let target = request
        .uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "uri")
                .map(|(_, v)| v.into_owned())
        })
        .and_then(|raw| Url::parse(&raw).ok());
    let Some(target) = target else {
        return (StatusCode::BAD_REQUEST, "missing or invalid uri").into_response();
    };

    let host = match (target.host_str(), target.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return (StatusCode::BAD_REQUEST, "missing or invalid uri").into_response(),
    };
    let Some(pipeline) = table.pipeline(&host) else {
        return ProxyError::UnknownRoute { host }.into_response();
    };
    if pipeline.policy().allow_public_unauthenticated_access {
        return StatusCode::OK.into_response();
    }

    let context = table.context();
    let state = match context.loaders.load(request.headers(), request.uri()) {
        Ok(state) => state,
        Err(e) => {
            tracing::debug!(error = %e, target = %target, "Forward-auth request without a valid session");
            return ProxyError::Unauthenticated.into_response();
        }
    };

    let method = request
        .headers()
        .get(&X_FORWARDED_METHOD)
        .and_then(|v| Method::from_bytes(v.as_bytes()).ok())
        .unwrap_or(Method::GET);
    let path_and_query = match target.query() {
        Some(query) => format!("{}?{}", target.path(), query),
        None => target.path().to_string(),
    };
    let route = RouteRequest {
        method: method.to_string(),
        host: pipeline.policy().source_host(),
        path: target.path().to_string(),
        url: format!("https://{}{}", pipeline.policy().source_host(), path_and_query),
    };

    let verdict = tokio::time::timeout(
        context.authorize_timeout,
        context.authorizer.authorize(&state, &route),
    )
    .await;

    match verdict {
        Ok(Ok(decision)) if decision.allow => {
            metrics::record_authorization("allow");
            let mut response = StatusCode::OK.into_response();
            set_identity_headers(response.headers_mut(), &state);
            response
        }
        Ok(Ok(decision)) => {
            metrics::record_authorization("deny");
            tracing::info!(
                user = %state.user_id(),
                target = %target,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Forward-auth access denied"
            );
            ProxyError::Forbidden.into_response()
        }
        Ok(Err(e)) => {
            metrics::record_authorization("error");
            tracing::warn!(user = %state.user_id(), target = %target, error = %e, "Forward-auth authorization failed");
            ProxyError::Forbidden.into_response()
        }
        Err(_) => {
            metrics::record_authorization("error");
            tracing::warn!(user = %state.user_id(), target = %target, "Forward-auth authorization timed out");
            ProxyError::Forbidden.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::header;
    use base64::Engine as _;

    use super::*;
    use crate::config::{GatewayConfig, PolicyConfig};
    use crate::authorize::Authorizer;
    use crate::proxy::pipeline::testing::{alice, session_cookie, FailingAuthorizer, SlowAuthorizer, StaticAuthorizer};
    use crate::proxy::RouteAuthority;
    use crate::security::headers::USER_ID_HEADER;
    use crate::sessions::codec::generate_key;

    fn authority(allow: bool) -> RouteAuthority {
        authority_with(Arc::new(StaticAuthorizer(allow)))
    }

    fn authority_with(authorizer: Arc<dyn Authorizer>) -> RouteAuthority {
        let mut config = GatewayConfig::default();
        config.timeouts.authorize_ms = 50;
        config.session.cookie_secret = base64::engine::general_purpose::STANDARD.encode(generate_key());
        config.services.authenticate_url = "https://auth.example.com".into();
        config.services.forward_auth_url = Some("https://fwd.example.com".into());
        config.policies.push(PolicyConfig {
            from: "https://app.example.com".into(),
            to: "http://app.internal".into(),
            ..Default::default()
        });
        config.policies.push(PolicyConfig {
            from: "https://public.example.com".into(),
            to: "http://public.internal".into(),
            allow_public_unauthenticated_access: true,
            ..Default::default()
        });
        RouteAuthority::with_authorizer(&config, authorizer).unwrap()
    }

    fn verify(uri: &str, cookie: Option<String>) -> Request {
        let mut builder = Request::builder()
            .uri(format!("/verify?uri={}", uri))
            .header(header::HOST, "fwd.example.com");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn verifies_sessions_for_known_routes() {
        let authority = authority(true);
        let cookie = session_cookie(&authority.snapshot().context().cookie_store, &alice());

        let response = authority
            .dispatch(verify("https%3A%2F%2Fapp.example.com%2Fx", Some(cookie)))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[USER_ID_HEADER], "alice");

        let response = authority.dispatch(verify("https%3A%2F%2Fapp.example.com%2Fx", None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = authority.dispatch(verify("https%3A%2F%2Fpublic.example.com%2F", None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = authority.dispatch(verify("https%3A%2F%2Fnope.example.com%2F", None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn denied_verification_is_forbidden() {
        let authority = authority(false);
        let cookie = session_cookie(&authority.snapshot().context().cookie_store, &alice());
        let response = authority
            .dispatch(verify("https%3A%2F%2Fapp.example.com%2Fx", Some(cookie)))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn authorizer_failure_or_timeout_is_forbidden() {
        for authorizer in [
            Arc::new(FailingAuthorizer) as Arc<dyn Authorizer>,
            Arc::new(SlowAuthorizer(std::time::Duration::from_millis(500))),
        ] {
            let authority = authority_with(authorizer);
            let cookie = session_cookie(&authority.snapshot().context().cookie_store, &alice());
            let response = authority
                .dispatch(verify("https%3A%2F%2Fapp.example.com%2Fx", Some(cookie)))
                .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert!(!response.headers().contains_key(USER_ID_HEADER));
        }
    }

    #[tokio::test]
    async fn verify_host_matches_with_explicit_port() {
        let authority = authority(true);
        let cookie = session_cookie(&authority.snapshot().context().cookie_store, &alice());
        let mut request = verify("https%3A%2F%2Fapp.example.com%2Fx", Some(cookie));
        request
            .headers_mut()
            .insert(header::HOST, axum::http::HeaderValue::from_static("FWD.example.com:443"));

        let response = authority.dispatch(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[USER_ID_HEADER], "alice");
    }
}
