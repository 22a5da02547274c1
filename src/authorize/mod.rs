//! Authorization collaborator.
//!
//! # Data Flow
//! ```text
//! authorize stage (identity, route)
//!     → Authorizer::authorize
//!     → client.rs (JSON over HTTP to the authorization service)
//!     → Decision { allow, reason }
//! ```
//!
//! # Design Decisions
//! - Any error is a deny at the call site; never retried
//! - The trait is the seam; tests substitute in-process authorizers

pub mod client;

use async_trait::async_trait;
use axum::http::{Method, Uri};
use serde::{Deserialize, Serialize};

use crate::sessions::SessionState;

pub use client::HttpAuthorizer;

/// The request being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub url: String,
}

impl RouteRequest {
    pub fn new(method: &Method, host: &str, uri: &Uri) -> Self {
        let path_and_query = uri.path_and_query().map_or("/", |p| p.as_str());
        Self {
            method: method.to_string(),
            host: host.to_string(),
            path: uri.path().to_string(),
            url: format!("https://{}{}", host, path_and_query),
        }
    }
}

/// Verdict from the authorization service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorizeError {
    #[error("authorization transport error: {0}")]
    Transport(String),
    #[error("authorization service returned {0}")]
    Status(u16),
    #[error("authorization response undecodable: {0}")]
    Decode(String),
    #[error("authorization timed out")]
    Timeout,
}

/// Decides whether an identity may use a route.
#[async_trait]
pub trait Authorizer: Send + Sync + std::fmt::Debug {
    async fn authorize(
        &self,
        identity: &SessionState,
        route: &RouteRequest,
    ) -> Result<Decision, AuthorizeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_request_from_uri() {
        let uri: Uri = "/a/b?x=1".parse().unwrap();
        let route = RouteRequest::new(&Method::POST, "app.example.com", &uri);
        assert_eq!(route.method, "POST");
        assert_eq!(route.path, "/a/b");
        assert_eq!(route.url, "https://app.example.com/a/b?x=1");
    }

    #[test]
    fn decision_reason_is_optional() {
        let d: Decision = serde_json::from_str(r#"{"allow":true}"#).unwrap();
        assert_eq!(d, Decision::allow());
    }
}
