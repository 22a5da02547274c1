//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request:
//!     → headers.rs (drop forged identity headers)
//!     → route pipeline (authenticate, authorize)
//!     → signer.rs (identity assertion for the upstream)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → upstream
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - No trust in client-supplied identity

pub mod headers;
pub mod signer;

pub use signer::Signer;
