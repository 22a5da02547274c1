//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use gatehouse::config::{GatewayConfig, PolicyConfig};
use gatehouse::http::HttpServer;
use gatehouse::lifecycle::Shutdown;
use gatehouse::sessions::{EncryptedJsonCodec, SessionCodec, SessionState};

pub const SECRET: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
pub const SHARED_SECRET: &str = "test-shared-secret";

/// Start a mock upstream that echoes what it received as JSON.
///
/// `/slow` waits 500ms before answering.
pub async fn start_upstream(name: &'static str) -> SocketAddr {
    let app = Router::new().fallback(move |request: Request| async move {
        if request.uri().path() == "/slow" {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let headers: BTreeMap<String, String> = request
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        Json(json!({
            "upstream": name,
            "path": request.uri().path(),
            "headers": headers,
        }))
    });
    serve(app).await
}

/// Start a mock authorize service.
///
/// Allows `alice` everywhere except paths under `/admin`; denies everyone else.
/// Requests without the shared secret get a 401.
pub async fn start_authorizer() -> SocketAddr {
    let app = Router::new().route(
        "/authorize",
        post(|headers: axum::http::HeaderMap, Json(body): Json<Value>| async move {
            let expected = format!("Bearer {}", SHARED_SECRET);
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
                return Err(StatusCode::UNAUTHORIZED);
            }
            let user = body["identity"]["user"].as_str().unwrap_or_default();
            let path = body["route"]["path"].as_str().unwrap_or_default();
            let allow = user == "alice" && !path.starts_with("/admin");
            Ok(Json(json!({ "allow": allow, "reason": if allow { "" } else { "policy" } })))
        }),
    );
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A config with one protected policy for `app.example.com` pointing at `upstream`.
pub fn gateway_config(upstream: SocketAddr, authorizer: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.session.cookie_secret = SECRET.into();
    config.services.authenticate_url = "https://auth.example.com".into();
    config.services.authorize_url = format!("http://{}", authorizer);
    config.services.shared_secret = SHARED_SECRET.into();
    config.timeouts.authorize_ms = 1_000;
    config.policies.push(policy("app.example.com", upstream));
    config
}

pub fn policy(host: &str, upstream: SocketAddr) -> PolicyConfig {
    PolicyConfig {
        from: format!("https://{}", host),
        to: format!("http://{}", upstream),
        ..Default::default()
    }
}

/// A running gateway and the handles to drive it.
pub struct Gateway {
    pub addr: SocketAddr,
    pub updates: mpsc::UnboundedSender<GatewayConfig>,
    pub shutdown: Shutdown,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_gateway(config: GatewayConfig) -> Gateway {
    let shutdown = Shutdown::new();
    let (updates, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    Gateway {
        addr,
        updates,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// `Authorization` header value carrying a session for `user`.
pub fn bearer(user: &str) -> String {
    let codec = EncryptedJsonCodec::from_base64(SECRET).unwrap();
    let token = codec
        .encode(&SessionState {
            user: user.into(),
            email: format!("{}@example.com", user),
            groups: vec!["eng".into()],
            ..Default::default()
        })
        .unwrap();
    format!("Gatehouse {}", token)
}
