//! Route authority subsystem.
//!
//! # Data Flow
//! ```text
//! GatewayConfig
//!     → policy.rs (parse URLs, load TLS material, validate headers)
//!     → transport.rs (baseline client or policy-specific TLS client)
//!     → pipeline.rs (fixed-order stages around forward.rs)
//!     → authority.rs (RoutingTable, published via ArcSwap)
//!
//! Per request:
//!     authority.rs snapshot → robots | dashboard | forward-auth | pipeline | 404
//! ```
//!
//! # Design Decisions
//! - A table is built in full before it is published; any failure keeps the old one
//! - Stage order is fixed; policy flags only add or omit stages
//! - Errors fail closed and carry no internal detail to the client

pub mod authority;
pub mod forward;
pub mod pipeline;
pub mod policy;
pub mod transport;

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub use authority::{RouteAuthority, RoutingTable};
pub use forward::Forwarder;
pub use pipeline::{PipelineBuilder, RoutePipeline, Stage};
pub use policy::{Policy, PolicyError};
pub use transport::{InstrumentedTransport, TransportFactory};

/// Request-time failures surfaced to clients.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{host} route unknown")]
    UnknownRoute { host: String },

    #[error("{host} timed out in {timeout:?}")]
    UpstreamTimeout { host: String, timeout: Duration },

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("access denied")]
    Forbidden,

    #[error("not authenticated")]
    Unauthenticated,

    #[error("could not sign identity assertion")]
    Signing,

    #[error("invalid forwarding target: {0}")]
    Target(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownRoute { .. } => StatusCode::NOT_FOUND,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Forbidden => StatusCode::FORBIDDEN,
            ProxyError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ProxyError::Signing | ProxyError::Target(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ProxyError::UnknownRoute { .. } | ProxyError::UpstreamTimeout { .. } => self.to_string(),
            _ => status
                .canonical_reason()
                .unwrap_or("error")
                .to_string(),
        };
        (status, body).into_response()
    }
}
