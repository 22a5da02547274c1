//! Session identity claims.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::sessions::SessionError;

/// Identity claims carried by a session token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Subject identifier issued by the identity provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,

    /// User identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,

    /// Issued-at, unix seconds.
    #[serde(default)]
    pub iat: i64,

    /// Expiry, unix seconds. `None` never expires on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl SessionState {
    /// Check the time-bound claims against `now` (unix seconds).
    pub fn verify(&self, now: i64) -> Result<(), SessionError> {
        match self.exp {
            Some(exp) if exp <= now => Err(SessionError::Expired),
            _ => Ok(()),
        }
    }

    /// The identifier forwarded upstream and handed to the authorizer.
    pub fn user_id(&self) -> &str {
        if self.user.is_empty() {
            &self.sub
        } else {
            &self.user
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
