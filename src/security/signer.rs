//! Signed identity assertions for upstreams.
//!
//! Each route with signing enabled gets its own [`Signer`] whose audience is
//! the destination host, so an assertion minted for one upstream is useless
//! against another.

use base64::Engine as _;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::sessions::state::unix_now;
use crate::sessions::SessionState;

/// Header carrying the assertion to the upstream.
pub const ASSERTION_HEADER: &str = "x-gatehouse-jwt-assertion";

/// Assertion lifetime in seconds.
pub const ASSERTION_TTL_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing key is not valid base64 or PEM: {0}")]
    Encoding(String),
    #[error("signing key is not an EC private key: {0}")]
    Key(#[source] jsonwebtoken::errors::Error),
    #[error("signing failed: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
}

/// Claims of the assertion attached to forwarded requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub sub: String,
    pub user: String,
    pub email: String,
    pub groups: Vec<String>,
}

/// ES256 signer bound to one audience.
#[derive(Clone)]
pub struct Signer {
    key: EncodingKey,
    audience: String,
}

impl Signer {
    /// `signing_key` is a PEM EC private key, optionally base64 wrapped.
    pub fn new(signing_key: &str, audience: impl Into<String>) -> Result<Self, SignerError> {
        let pem = decode_pem(signing_key)?;
        let key = EncodingKey::from_ec_pem(&pem).map_err(SignerError::Key)?;
        Ok(Self {
            key,
            audience: audience.into(),
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Mint a short-lived assertion for `state`.
    pub fn sign(&self, state: &SessionState) -> Result<String, SignerError> {
        let now = unix_now();
        let claims = AssertionClaims {
            aud: self.audience.clone(),
            iat: now,
            nbf: now,
            exp: now + ASSERTION_TTL_SECS,
            sub: state.sub.clone(),
            user: state.user_id().to_string(),
            email: state.email.clone(),
            groups: state.groups.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.key)
            .map_err(SignerError::Sign)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

fn decode_pem(signing_key: &str) -> Result<Vec<u8>, SignerError> {
    let trimmed = signing_key.trim();
    if trimmed.starts_with("-----BEGIN") {
        return Ok(trimmed.as_bytes().to_vec());
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map_err(|e| SignerError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    #[test]
    fn signs_verifiable_assertion() {
        let pair = rcgen::KeyPair::generate().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(pair.serialize_pem());
        let signer = Signer::new(&encoded, "app.internal").unwrap();

        let state = SessionState {
            sub: "sub-1".into(),
            user: "alice".into(),
            email: "alice@example.com".into(),
            groups: vec!["eng".into()],
            ..Default::default()
        };
        let token = signer.sign(&state).unwrap();

        let key = DecodingKey::from_ec_pem(pair.public_key_pem().as_bytes()).unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&["app.internal"]);
        let decoded = jsonwebtoken::decode::<AssertionClaims>(&token, &key, &validation).unwrap();

        assert_eq!(decoded.claims.user, "alice");
        assert_eq!(decoded.claims.groups, vec!["eng".to_string()]);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_TTL_SECS);
    }

    #[test]
    fn accepts_raw_pem() {
        let pair = rcgen::KeyPair::generate().unwrap();
        assert!(Signer::new(&pair.serialize_pem(), "aud").is_ok());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            Signer::new("%%%", "aud"),
            Err(SignerError::Encoding(_))
        ));
        let not_pem = base64::engine::general_purpose::STANDARD.encode("hello");
        assert!(matches!(Signer::new(&not_pem, "aud"), Err(SignerError::Key(_))));
    }
}
