//! Cookie-backed session store.
//!
//! # Responsibilities
//! - Save a session as one cookie, or as ordered chunks when oversized
//! - Reassemble and decode the session on load
//! - Clear the session with attributes matching the original cookie
//! - Strip session cookies before a request leaves for an upstream
//!
//! # Chunk Naming
//! ```text
//! encoded ≤ MAX_CHUNK_SIZE:   _gatehouse=<payload>
//! encoded > MAX_CHUNK_SIZE:   _gatehouse_0_3=<part 0>
//!                             _gatehouse_1_3=<part 1>
//!                             _gatehouse_2_3=<part 2>
//! ```
//! Index and count travel in the cookie name, so reassembly never depends on
//! the order a browser sends cookies back in.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cookie::Cookie;
use time::OffsetDateTime;

use crate::sessions::{SessionCodec, SessionError, SessionState};

/// Largest percent-encoded value carried by a single cookie.
pub const MAX_CHUNK_SIZE: usize = 3800;

/// Upper bound on cookies emitted for one session.
pub const MAX_CHUNKS: usize = 8;

/// Attributes shared by every cookie the store sets or clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub name: String,
    pub domain: String,
    pub secure: bool,
    pub http_only: bool,
    /// Zero means a browser-session cookie.
    pub expire: Duration,
}

/// Value handed to [`CookieSessionStore::save_session`].
#[derive(Debug, Clone, Copy)]
pub enum SessionValue<'a> {
    /// Encoded through the store's codec.
    Structured(&'a SessionState),
    /// Stored verbatim.
    Text(&'a str),
    /// Stored as URL-safe base64.
    Bytes(&'a [u8]),
}

impl<'a> From<&'a SessionState> for SessionValue<'a> {
    fn from(state: &'a SessionState) -> Self {
        SessionValue::Structured(state)
    }
}

impl<'a> From<&'a str> for SessionValue<'a> {
    fn from(text: &'a str) -> Self {
        SessionValue::Text(text)
    }
}

impl<'a> From<&'a [u8]> for SessionValue<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        SessionValue::Bytes(bytes)
    }
}

/// Saves, loads and clears sessions carried in cookies.
#[derive(Debug, Clone)]
pub struct CookieSessionStore {
    options: CookieOptions,
    encoder: Option<Arc<dyn SessionCodec>>,
    decoder: Option<Arc<dyn SessionCodec>>,
}

impl CookieSessionStore {
    /// Create a store that both encodes and decodes with `codec`.
    pub fn new(
        options: CookieOptions,
        codec: Option<Arc<dyn SessionCodec>>,
    ) -> Result<Self, SessionError> {
        let codec = codec.ok_or(SessionError::ConfigurationGap("codec"))?;
        Self::with_codecs(options, Some(codec.clone()), Some(codec))
    }

    /// Create a store with independently optional encoder and decoder.
    ///
    /// Calls that need a missing capability fail with
    /// [`SessionError::ConfigurationGap`].
    pub fn with_codecs(
        options: CookieOptions,
        encoder: Option<Arc<dyn SessionCodec>>,
        decoder: Option<Arc<dyn SessionCodec>>,
    ) -> Result<Self, SessionError> {
        if options.name.is_empty() {
            return Err(SessionError::InvalidOptions("cookie name is required"));
        }
        Ok(Self {
            options,
            encoder,
            decoder,
        })
    }

    pub fn options(&self) -> &CookieOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Write the session into `response` as one or more `Set-Cookie` headers.
    ///
    /// Nothing is appended unless every cookie renders, so a failure never
    /// leaves a partial chunk set behind.
    pub fn save_session<'v>(
        &self,
        response: &mut HeaderMap,
        request: &HeaderMap,
        value: impl Into<SessionValue<'v>>,
    ) -> Result<(), SessionError> {
        let payload = match value.into() {
            SessionValue::Text(text) => text.to_owned(),
            SessionValue::Bytes(bytes) => URL_SAFE_NO_PAD.encode(bytes),
            SessionValue::Structured(state) => {
                let encoder = self
                    .encoder
                    .as_ref()
                    .ok_or(SessionError::ConfigurationGap("encoder"))?;
                encoder.encode(state)?
            }
        };

        let chunks = split_payload(&payload, MAX_CHUNK_SIZE);
        if chunks.len() > MAX_CHUNKS {
            return Err(SessionError::PayloadTooLarge(chunks.len()));
        }

        let mut cookies = Vec::with_capacity(chunks.len());
        if let [single] = chunks.as_slice() {
            cookies.push(self.session_cookie(self.options.name.clone(), (*single).to_owned()));
        } else {
            let count = chunks.len();
            for (index, chunk) in chunks.iter().enumerate() {
                cookies.push(self.session_cookie(chunk_name(&self.options.name, index, count), (*chunk).to_owned()));
            }
        }

        // Drop leftovers from an earlier save that the new set does not overwrite.
        for (name, _) in request_cookies(request) {
            let owned = self.is_session_cookie(&name);
            if owned && !cookies.iter().any(|c| c.name() == name) {
                cookies.push(self.removal_cookie(name));
            }
        }

        let rendered = cookies
            .iter()
            .map(|c| HeaderValue::from_str(&c.encoded().to_string()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SessionError::InvalidHeader(e.to_string()))?;

        for value in rendered {
            response.append(SET_COOKIE, value);
        }

        tracing::debug!(
            cookie = %self.options.name,
            chunks = chunks.len(),
            "Session saved"
        );
        Ok(())
    }

    /// Read, reassemble and decode the session carried by `request`.
    pub fn load_session(&self, request: &HeaderMap) -> Result<SessionState, SessionError> {
        let mut exact = None;
        let mut chunks = Vec::new();

        for (name, value) in request_cookies(request) {
            if name == self.options.name {
                exact.get_or_insert(value);
            } else if let Some((index, count)) = parse_chunk_name(&self.options.name, &name) {
                chunks.push((index, count, value));
            }
        }

        let payload = match exact {
            Some(value) => value,
            None if chunks.is_empty() => return Err(SessionError::NoSession),
            None => assemble_chunks(chunks)?,
        };

        let decoder = self
            .decoder
            .as_ref()
            .ok_or(SessionError::ConfigurationGap("decoder"))?;
        Ok(decoder.decode(&payload)?)
    }

    /// Expire the session cookie, and any chunk cookies the request carries.
    pub fn clear_session(&self, response: &mut HeaderMap, request: &HeaderMap) {
        let mut names = vec![self.options.name.clone()];
        for (name, _) in request_cookies(request) {
            if parse_chunk_name(&self.options.name, &name).is_some() && !names.contains(&name) {
                names.push(name);
            }
        }

        for name in names {
            let cookie = self.removal_cookie(name);
            match HeaderValue::from_str(&cookie.encoded().to_string()) {
                Ok(value) => {
                    response.append(SET_COOKIE, value);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unrenderable removal cookie"),
            }
        }
    }

    /// Remove this store's cookies from an outbound request, keeping the rest.
    pub fn strip_session_cookies(&self, headers: &mut HeaderMap) {
        let kept: Vec<String> = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let name = pair.split_once('=').map_or(*pair, |(n, _)| n).trim();
                !self.is_session_cookie(name)
            })
            .map(str::to_owned)
            .collect();

        headers.remove(COOKIE);
        if kept.is_empty() {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
            headers.insert(COOKIE, value);
        }
    }

    fn is_session_cookie(&self, name: &str) -> bool {
        name == self.options.name || parse_chunk_name(&self.options.name, name).is_some()
    }

    fn session_cookie(&self, name: String, value: String) -> Cookie<'static> {
        let mut cookie = self.base_cookie(name, value);
        if !self.options.expire.is_zero() {
            if let Ok(max_age) = time::Duration::try_from(self.options.expire) {
                cookie.set_max_age(max_age);
                if let Some(at) = OffsetDateTime::now_utc().checked_add(max_age) {
                    cookie.set_expires(at);
                }
            }
        }
        cookie
    }

    fn removal_cookie(&self, name: String) -> Cookie<'static> {
        let mut cookie = self.base_cookie(name, String::new());
        cookie.set_max_age(time::Duration::ZERO);
        cookie.set_expires(OffsetDateTime::UNIX_EPOCH);
        cookie
    }

    // Set and clear share this so the browser matches them as the same cookie.
    fn base_cookie(&self, name: String, value: String) -> Cookie<'static> {
        let mut builder = Cookie::build((name, value))
            .path("/")
            .secure(self.options.secure)
            .http_only(self.options.http_only);
        if !self.options.domain.is_empty() {
            builder = builder.domain(self.options.domain.clone());
        }
        builder.build()
    }
}

fn chunk_name(base: &str, index: usize, count: usize) -> String {
    format!("{}_{}_{}", base, index, count)
}

/// Parse `{base}_{index}_{count}` into `(index, count)`.
fn parse_chunk_name(base: &str, name: &str) -> Option<(usize, usize)> {
    let suffix = name.strip_prefix(base)?.strip_prefix('_')?;
    let (index, count) = suffix.split_once('_')?;
    if !is_digits(index) || !is_digits(count) {
        return None;
    }
    let index: usize = index.parse().ok()?;
    let count: usize = count.parse().ok()?;
    (count >= 2 && index < count).then_some((index, count))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn assemble_chunks(mut chunks: Vec<(usize, usize, String)>) -> Result<String, SessionError> {
    let count = chunks[0].1;
    if count > MAX_CHUNKS || chunks.len() != count || chunks.iter().any(|(_, n, _)| *n != count) {
        return Err(SessionError::MalformedChunks);
    }

    chunks.sort_by_key(|(index, _, _)| *index);
    if chunks.iter().enumerate().any(|(expected, (index, _, _))| expected != *index) {
        return Err(SessionError::MalformedChunks);
    }

    Ok(chunks.into_iter().map(|(_, _, value)| value).collect())
}

/// Split `payload` so every part stays within `size` bytes once percent-encoded.
///
/// Parts end on char boundaries; a part holds at least one char.
fn split_payload(payload: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (at, c) in payload.char_indices() {
        let width = encoded_len(c);
        if used + width > size && at > start {
            chunks.push(&payload[start..at]);
            start = at;
            used = 0;
        }
        used += width;
    }
    chunks.push(&payload[start..]);
    chunks
}

/// Bytes `c` occupies in a `Set-Cookie` value after cookie encoding.
fn encoded_len(c: char) -> usize {
    if !c.is_ascii() {
        return 3 * c.len_utf8();
    }
    let mut buf = [0u8; 4];
    let value: &str = c.encode_utf8(&mut buf);
    // Rendered as "=<value>" for an empty name.
    Cookie::new("", value).encoded().to_string().len() - 1
}

/// Every `(name, value)` pair from the request's `Cookie` headers.
fn request_cookies(request: &HeaderMap) -> Vec<(String, String)> {
    request
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| Cookie::split_parse_encoded(v.to_owned()))
        .filter_map(Result::ok)
        .map(|c| (c.name().to_owned(), c.value().to_owned()))
        .collect()
}
