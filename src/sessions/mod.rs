//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! Sign-in callback:
//!     SessionState
//!     → codec.rs (serialize, seal, encode)
//!     → cookie.rs (single cookie or ordered chunks)
//!     → Set-Cookie headers
//!
//! Every protected request:
//!     loader.rs chain: cookie → header → query parameter
//!     → first source that finds a token decides (no downgrade)
//!     → SessionState attached to the request
//! ```
//!
//! # Design Decisions
//! - Codec is injected, never selected by inspecting the value
//! - Missing session is distinct from an invalid one
//! - Cookie writes are all-or-nothing per response

pub mod codec;
pub mod cookie;
pub mod loader;
pub mod state;

pub use codec::{EncryptedJsonCodec, SessionCodec};
pub use cookie::{CookieOptions, CookieSessionStore, SessionValue};
pub use loader::{HeaderStore, QueryParamStore, SessionLoader, SessionLoaderChain};
pub use state::SessionState;

/// Failure to turn a session into a protected payload or back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Errors from session storage and retrieval.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session token was presented.
    #[error("no session")]
    NoSession,

    #[error("session expired")]
    Expired,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("session cookie chunks are incomplete or inconsistent")]
    MalformedChunks,

    #[error("session payload needs {0} cookies, above the chunk limit")]
    PayloadTooLarge(usize),

    /// A codec capability the call needs was not configured.
    #[error("no session {0} configured")]
    ConfigurationGap(&'static str),

    #[error("invalid cookie header: {0}")]
    InvalidHeader(String),

    #[error("invalid cookie options: {0}")]
    InvalidOptions(&'static str),
}

impl SessionError {
    /// True when a token was found but could not be accepted.
    pub fn is_invalid(&self) -> bool {
        !matches!(self, SessionError::NoSession)
    }
}
