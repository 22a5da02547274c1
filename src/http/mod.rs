//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID, tracing, body limit)
//!     → RouteAuthority::dispatch
//!         → dashboard.rs (/.gatehouse/* on any routed host)
//!         → forward_auth.rs (/verify on the forward-auth host)
//!         → policy pipeline (crate::proxy)
//!     → Send to client
//! ```

pub mod dashboard;
pub mod forward_auth;
pub mod request;
pub mod server;

pub use request::X_REQUEST_ID;
pub use server::HttpServer;
