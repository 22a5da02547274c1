//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (optional TLS handshake, listener certificate)
//!     → Hand off to HTTP layer
//!
//! Outgoing upstream connection
//!     → tls.rs (custom CA and client certificate loading)
//!     → proxy::transport
//! ```

pub mod tls;
