//! Reverse-proxy forwarder.
//!
//! # Responsibilities
//! - Rewrite scheme and authority to the destination, joining its path prefix
//! - Strip hop-by-hop headers and add X-Forwarded-*
//! - Relay upgraded connections when the route allows websockets
//! - Map transport failures to 502
//!
//! # Data Flow
//! ```text
//! client request
//!     → rewrite URI + headers
//!     → InstrumentedTransport
//!     → 101? spawn bidirectional copy : stream response back
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use hyper_util::rt::TokioIo;
use url::Url;

use crate::proxy::policy::Policy;
use crate::proxy::transport::InstrumentedTransport;
use crate::proxy::ProxyError;
use crate::security::headers;

/// Forwards requests for one policy to its destination.
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

struct ForwarderInner {
    destination: Url,
    source_host: String,
    source_proto: String,
    transport: InstrumentedTransport,
    allow_websockets: bool,
}

impl Forwarder {
    pub fn new(policy: &Policy, transport: InstrumentedTransport) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                destination: policy.destination.clone(),
                source_host: policy.source_host(),
                source_proto: policy.source.scheme().to_string(),
                transport,
                allow_websockets: policy.allow_websockets,
            }),
        }
    }

    pub fn destination(&self) -> &Url {
        &self.inner.destination
    }

    /// Send `request` upstream and return the upstream response.
    pub async fn forward(&self, mut request: Request<Body>) -> Response<Body> {
        let upgrade = self.inner.allow_websockets && headers::is_upgrade_request(request.headers());
        let upgrade_protocol = request.headers().get(header::UPGRADE).cloned();
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut request));

        let (mut parts, body) = request.into_parts();

        parts.uri = match self.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => return e.into_response(),
        };

        let client_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.inner.source_host)
            .to_string();

        headers::strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        headers::set_forwarded(
            &mut parts.headers,
            client_ip,
            Some(&original_host),
            &self.inner.source_proto,
        );
        if let (true, Some(protocol)) = (upgrade, upgrade_protocol) {
            parts.headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(header::UPGRADE, protocol);
        }

        tracing::debug!(
            destination = %self.inner.transport.destination(),
            method = %parts.method,
            uri = %parts.uri,
            "Forwarding request"
        );

        let mut response = match self.inner.transport.request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    destination = %self.inner.transport.destination(),
                    error = %e,
                    "Upstream request failed"
                );
                return ProxyError::Upstream(e.to_string()).into_response();
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(client_upgrade) = client_upgrade {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                let destination = self.inner.transport.destination().to_string();
                tokio::spawn(async move {
                    match tokio::try_join!(client_upgrade, upstream_upgrade) {
                        Ok((client, upstream)) => {
                            let mut client = TokioIo::new(client);
                            let mut upstream = TokioIo::new(upstream);
                            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                                tracing::debug!(destination = %destination, error = %e, "Upgraded connection closed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(destination = %destination, error = %e, "Connection upgrade failed");
                        }
                    }
                });
                let (parts, _) = response.into_parts();
                return Response::from_parts(parts, Body::empty());
            }
        }

        let (mut parts, body) = response.into_parts();
        headers::strip_hop_by_hop(&mut parts.headers);
        Response::from_parts(parts, Body::new(body))
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let destination = &self.inner.destination;
        let scheme = Scheme::try_from(destination.scheme())
            .map_err(|e| ProxyError::Target(e.to_string()))?;
        let authority = Authority::try_from(destination_authority(destination).as_str())
            .map_err(|e| ProxyError::Target(e.to_string()))?;

        let path = join_path(destination.path(), original.path());
        let path_and_query = match original.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let path_and_query = PathAndQuery::try_from(path_and_query.as_str())
            .map_err(|e| ProxyError::Target(e.to_string()))?;

        Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::Target(e.to_string()))
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("destination", &self.inner.destination.as_str())
            .field("allow_websockets", &self.inner.allow_websockets)
            .finish()
    }
}

/// Axum handler terminating every route pipeline.
pub async fn forward_handler(State(forwarder): State<Forwarder>, request: Request<Body>) -> Response<Body> {
    forwarder.forward(request).await
}

fn destination_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Join the destination path prefix with the request path.
fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{}/{}", prefix, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::proxy::transport::TransportFactory;
    use std::time::Duration;

    fn forwarder(to: &str) -> Forwarder {
        let policy = Policy::from_config(&PolicyConfig {
            from: "https://app.example.com".into(),
            to: to.into(),
            ..Default::default()
        })
        .unwrap();
        let transport = TransportFactory::new(Duration::from_secs(1))
            .unwrap()
            .for_policy(&policy)
            .unwrap();
        Forwarder::new(&policy, transport)
    }

    #[test]
    fn joins_paths() {
        assert_eq!(join_path("", "/a/b"), "/a/b");
        assert_eq!(join_path("/", "/a"), "/a");
        assert_eq!(join_path("/api", "/v1/users"), "/api/v1/users");
        assert_eq!(join_path("/api/", "/v1"), "/api/v1");
        assert_eq!(join_path("/api", "/"), "/api/");
    }

    #[test]
    fn rewrites_uri_to_destination() {
        let f = forwarder("http://app.internal:8080/base");
        let uri: Uri = "/users?id=7".parse().unwrap();
        let upstream = f.upstream_uri(&uri).unwrap();
        assert_eq!(upstream.to_string(), "http://app.internal:8080/base/users?id=7");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let f = forwarder(&format!("http://{}", addr));
        let request = Request::builder()
            .uri("/")
            .header(header::HOST, "app.example.com")
            .body(Body::empty())
            .unwrap();
        let response = f.forward(request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
