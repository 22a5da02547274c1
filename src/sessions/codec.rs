//! Session codecs.
//!
//! A codec turns a [`SessionState`] into cookie-safe protected text and back.
//! The production codec seals JSON with XChaCha20-Poly1305; decode failures
//! always surface as errors, never as a different state.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;

use crate::sessions::{CodecError, SessionState};

/// Key length for [`EncryptedJsonCodec`].
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

/// Encode/decode capability injected into stores and loaders.
pub trait SessionCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, state: &SessionState) -> Result<String, CodecError>;
    fn decode(&self, payload: &str) -> Result<SessionState, CodecError>;
}

/// Invalid key material handed to a codec constructor.
#[derive(Debug, thiserror::Error)]
#[error("invalid session key: {0}")]
pub struct InvalidKey(String);

/// Authenticated-encryption codec: `base64url(nonce || seal(json))`.
#[derive(Clone)]
pub struct EncryptedJsonCodec {
    cipher: XChaCha20Poly1305,
}

impl EncryptedJsonCodec {
    /// Build a codec from a raw 32-byte key.
    pub fn new(key: &[u8]) -> Result<Self, InvalidKey> {
        if key.len() != KEY_SIZE {
            return Err(InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build a codec from a standard base64 encoded key.
    pub fn from_base64(secret: &str) -> Result<Self, InvalidKey> {
        let key = decode_secret(secret).map_err(|e| InvalidKey(e.to_string()))?;
        Self::new(&key)
    }
}

impl std::fmt::Debug for EncryptedJsonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedJsonCodec").finish_non_exhaustive()
    }
}

impl SessionCodec for EncryptedJsonCodec {
    fn encode(&self, state: &SessionState) -> Result<String, CodecError> {
        let plaintext =
            serde_json::to_vec(state).map_err(|e| CodecError::Encode(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CodecError::Encode("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    fn decode(&self, payload: &str) -> Result<SessionState, CodecError> {
        let raw = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|e| CodecError::Decode(format!("bad encoding: {}", e)))?;

        if raw.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::Decode("payload truncated".into()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::Decode("authentication failed".into()))?;

        serde_json::from_slice(&plaintext).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Programmable codec for tests.
#[derive(Debug, Clone, Default)]
pub struct MockCodec {
    pub encode_error: Option<CodecError>,
    pub decode_error: Option<CodecError>,
    /// Returned by `encode`.
    pub payload: String,
    /// Returned by `decode`.
    pub state: SessionState,
}

impl SessionCodec for MockCodec {
    fn encode(&self, _state: &SessionState) -> Result<String, CodecError> {
        match &self.encode_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.payload.clone()),
        }
    }

    fn decode(&self, _payload: &str) -> Result<SessionState, CodecError> {
        match &self.decode_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.state.clone()),
        }
    }
}

/// Decode a standard base64 secret from configuration.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(secret.trim())
}

/// Fresh random key, for tests and key generation.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EncryptedJsonCodec {
        EncryptedJsonCodec::new(&generate_key()).unwrap()
    }

    fn alice() -> SessionState {
        SessionState {
            sub: "sub-1".into(),
            user: "alice".into(),
            email: "alice@example.com".into(),
            groups: vec!["admins".into()],
            iat: 1_700_000_000,
            exp: Some(1_900_000_000),
        }
    }

    #[test]
    fn round_trip() {
        let c = codec();
        let payload = c.encode(&alice()).unwrap();
        assert_eq!(c.decode(&payload).unwrap(), alice());
    }

    #[test]
    fn nonce_is_fresh_per_encode() {
        let c = codec();
        assert_ne!(c.encode(&alice()).unwrap(), c.encode(&alice()).unwrap());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(EncryptedJsonCodec::new(&[0u8; 16]).is_err());
        assert!(EncryptedJsonCodec::from_base64("not base64!").is_err());
    }

    #[test]
    fn tampered_payload_fails_closed() {
        let c = codec();
        let payload = c.encode(&alice()).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&payload).unwrap();

        for i in [0, NONCE_SIZE, raw.len() / 2, raw.len() - 1] {
            raw[i] ^= 0x01;
            let tampered = URL_SAFE_NO_PAD.encode(&raw);
            assert!(matches!(c.decode(&tampered), Err(CodecError::Decode(_))));
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn truncated_payload_fails() {
        let c = codec();
        let payload = c.encode(&alice()).unwrap();
        assert!(c.decode(&payload[..20]).is_err());
        assert!(c.decode("").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let payload = codec().encode(&alice()).unwrap();
        assert!(codec().decode(&payload).is_err());
    }
}
