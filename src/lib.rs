//! Gatehouse: an identity-aware reverse-proxy gateway.
//!
//! Requests are matched to a policy by host, authenticated from an encrypted
//! session, authorized by an external service and forwarded upstream.

pub mod authorize;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod security;
pub mod sessions;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::RouteAuthority;
