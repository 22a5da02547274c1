//! Session retrieval sources and the precedence chain.
//!
//! # Design Decisions
//! - Sources are consulted in configured order (cookie, header, query)
//! - The first source that finds a token decides the outcome
//! - An invalid token never falls through to a weaker source

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Uri};

use crate::sessions::state::unix_now;
use crate::sessions::{CookieSessionStore, SessionCodec, SessionError, SessionState};

/// Default `Authorization` scheme for bearer-style session tokens.
pub const DEFAULT_AUTH_SCHEME: &str = "Gatehouse";

/// Default query parameter carrying a session token.
pub const DEFAULT_QUERY_PARAM: &str = "gatehouse_session";

/// One place a session token can come from.
///
/// `Err(SessionError::NoSession)` means nothing was found; any other error
/// means a token was found and rejected.
pub trait SessionLoader: Send + Sync + std::fmt::Debug {
    fn load(&self, headers: &HeaderMap, uri: &Uri) -> Result<SessionState, SessionError>;

    /// Remove this source's token from a request bound for an upstream.
    fn strip(&self, _headers: &mut HeaderMap, _uri: &mut Uri) {}
}

impl SessionLoader for CookieSessionStore {
    fn load(&self, headers: &HeaderMap, _uri: &Uri) -> Result<SessionState, SessionError> {
        self.load_session(headers)
    }

    fn strip(&self, headers: &mut HeaderMap, _uri: &mut Uri) {
        self.strip_session_cookies(headers);
    }
}

/// Reads `Authorization: <scheme> <token>`.
#[derive(Debug, Clone)]
pub struct HeaderStore {
    codec: Arc<dyn SessionCodec>,
    scheme: String,
}

impl HeaderStore {
    pub fn new(codec: Arc<dyn SessionCodec>, scheme: impl Into<String>) -> Self {
        Self {
            codec,
            scheme: scheme.into(),
        }
    }

    fn token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(AUTHORIZATION)
            .iter()
            .find_map(|v| self.scheme_token(v))
    }

    /// The token in `value` if it uses this store's scheme.
    fn scheme_token<'a>(&self, value: &'a HeaderValue) -> Option<&'a str> {
        let (scheme, token) = value.to_str().ok()?.split_once(' ')?;
        scheme.eq_ignore_ascii_case(&self.scheme).then(|| token.trim())
    }
}

impl SessionLoader for HeaderStore {
    fn load(&self, headers: &HeaderMap, _uri: &Uri) -> Result<SessionState, SessionError> {
        let token = self.token(headers).ok_or(SessionError::NoSession)?;
        Ok(self.codec.decode(token)?)
    }

    /// Drops only `Authorization` values using the session scheme.
    fn strip(&self, headers: &mut HeaderMap, _uri: &mut Uri) {
        if self.token(headers).is_none() {
            return;
        }
        let kept: Vec<HeaderValue> = headers
            .get_all(AUTHORIZATION)
            .iter()
            .filter(|v| self.scheme_token(v).is_none())
            .cloned()
            .collect();
        headers.remove(AUTHORIZATION);
        for value in kept {
            headers.append(AUTHORIZATION, value);
        }
    }
}

/// Reads a token from a query parameter.
#[derive(Debug, Clone)]
pub struct QueryParamStore {
    codec: Arc<dyn SessionCodec>,
    param: String,
}

impl QueryParamStore {
    pub fn new(codec: Arc<dyn SessionCodec>, param: impl Into<String>) -> Self {
        Self {
            codec,
            param: param.into(),
        }
    }
}

impl SessionLoader for QueryParamStore {
    fn load(&self, _headers: &HeaderMap, uri: &Uri) -> Result<SessionState, SessionError> {
        let query = uri.query().ok_or(SessionError::NoSession)?;
        let token = url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == self.param.as_str())
            .map(|(_, value)| value.into_owned())
            .ok_or(SessionError::NoSession)?;
        Ok(self.codec.decode(&token)?)
    }

    /// Drops the token parameter, leaving other pairs byte-for-byte.
    fn strip(&self, _headers: &mut HeaderMap, uri: &mut Uri) {
        let Some(query) = uri.query() else {
            return;
        };
        let is_token = |pair: &&str| {
            url::form_urlencoded::parse(pair.as_bytes())
                .next()
                .is_some_and(|(key, _)| key == self.param.as_str())
        };
        if !query.split('&').any(|pair| is_token(&pair)) {
            return;
        }

        let kept: Vec<&str> = query.split('&').filter(|pair| !is_token(pair)).collect();
        let path_and_query = if kept.is_empty() {
            uri.path().to_string()
        } else {
            format!("{}?{}", uri.path(), kept.join("&"))
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = match path_and_query.parse() {
            Ok(path_and_query) => Some(path_and_query),
            Err(e) => {
                tracing::warn!(error = %e, "Could not rebuild request target without session token");
                return;
            }
        };
        match Uri::from_parts(parts) {
            Ok(stripped) => *uri = stripped,
            Err(e) => tracing::warn!(error = %e, "Could not rebuild request target without session token"),
        }
    }
}

/// Ordered set of loaders with strict precedence.
#[derive(Debug, Clone, Default)]
pub struct SessionLoaderChain {
    loaders: Vec<Arc<dyn SessionLoader>>,
}

impl SessionLoaderChain {
    pub fn new(loaders: Vec<Arc<dyn SessionLoader>>) -> Self {
        Self { loaders }
    }

    /// Retrieve the session from the highest-precedence source holding one.
    pub fn load(&self, headers: &HeaderMap, uri: &Uri) -> Result<SessionState, SessionError> {
        for loader in &self.loaders {
            match loader.load(headers, uri) {
                Err(SessionError::NoSession) => continue,
                Err(e) => {
                    tracing::debug!(source = ?loader, error = %e, "Session token rejected");
                    return Err(e);
                }
                Ok(state) => {
                    state.verify(unix_now())?;
                    return Ok(state);
                }
            }
        }
        Err(SessionError::NoSession)
    }

    /// Remove every source's token before the request goes upstream.
    pub fn strip(&self, headers: &mut HeaderMap, uri: &mut Uri) {
        for loader in &self.loaders {
            loader.strip(headers, uri);
        }
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::codec::{generate_key, EncryptedJsonCodec};
    use crate::sessions::{CodecError, CookieOptions};
    use axum::http::header::COOKIE;
    use std::time::Duration;

    struct Fixture {
        codec: Arc<dyn SessionCodec>,
        chain: SessionLoaderChain,
    }

    fn fixture() -> Fixture {
        let codec: Arc<dyn SessionCodec> =
            Arc::new(EncryptedJsonCodec::new(&generate_key()).unwrap());
        let cookies = CookieSessionStore::new(
            CookieOptions {
                name: "_gatehouse".into(),
                domain: String::new(),
                secure: true,
                http_only: true,
                expire: Duration::from_secs(60),
            },
            Some(codec.clone()),
        )
        .unwrap();
        let chain = SessionLoaderChain::new(vec![
            Arc::new(cookies),
            Arc::new(HeaderStore::new(codec.clone(), DEFAULT_AUTH_SCHEME)),
            Arc::new(QueryParamStore::new(codec.clone(), DEFAULT_QUERY_PARAM)),
        ]);
        Fixture { codec, chain }
    }

    fn named(user: &str) -> SessionState {
        SessionState {
            user: user.into(),
            ..Default::default()
        }
    }

    fn request(cookie: Option<&str>, header: Option<&str>, query: Option<&str>) -> (HeaderMap, Uri) {
        let mut headers = HeaderMap::new();
        if let Some(token) = cookie {
            headers.insert(COOKIE, HeaderValue::from_str(&format!("_gatehouse={}", token)).unwrap());
        }
        if let Some(token) = header {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Gatehouse {}", token)).unwrap(),
            );
        }
        let uri = match query {
            Some(token) => format!("/path?gatehouse_session={}", token),
            None => "/path".to_string(),
        };
        (headers, uri.parse().unwrap())
    }

    #[test]
    fn cookie_wins_over_header_and_query() {
        let f = fixture();
        let c = f.codec.encode(&named("cookie")).unwrap();
        let h = f.codec.encode(&named("header")).unwrap();
        let q = f.codec.encode(&named("query")).unwrap();

        let (headers, uri) = request(Some(&c), Some(&h), Some(&q));
        assert_eq!(f.chain.load(&headers, &uri).unwrap().user, "cookie");

        let (headers, uri) = request(None, Some(&h), Some(&q));
        assert_eq!(f.chain.load(&headers, &uri).unwrap().user, "header");

        let (headers, uri) = request(None, None, Some(&q));
        assert_eq!(f.chain.load(&headers, &uri).unwrap().user, "query");
    }

    #[test]
    fn invalid_cookie_does_not_fall_back() {
        let f = fixture();
        let h = f.codec.encode(&named("header")).unwrap();

        let (headers, uri) = request(Some("garbage"), Some(&h), None);
        assert!(matches!(
            f.chain.load(&headers, &uri),
            Err(SessionError::Codec(CodecError::Decode(_)))
        ));
    }

    #[test]
    fn invalid_header_does_not_fall_back_to_query() {
        let f = fixture();
        let q = f.codec.encode(&named("query")).unwrap();

        let (headers, uri) = request(None, Some("garbage"), Some(&q));
        assert!(f.chain.load(&headers, &uri).is_err());
    }

    #[test]
    fn expired_session_is_rejected() {
        let f = fixture();
        let expired = SessionState {
            exp: Some(1),
            ..named("old")
        };
        let token = f.codec.encode(&expired).unwrap();
        let (headers, uri) = request(None, Some(&token), None);
        assert_eq!(f.chain.load(&headers, &uri), Err(SessionError::Expired));
    }

    #[test]
    fn nothing_found_is_no_session() {
        let f = fixture();
        let (headers, uri) = request(None, None, None);
        assert_eq!(f.chain.load(&headers, &uri), Err(SessionError::NoSession));
        assert_eq!(
            SessionLoaderChain::default().load(&headers, &uri),
            Err(SessionError::NoSession)
        );
    }

    #[test]
    fn header_scheme_must_match() {
        let f = fixture();
        let token = f.codec.encode(&named("header")).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        let store = HeaderStore::new(f.codec.clone(), DEFAULT_AUTH_SCHEME);
        assert_eq!(
            store.load(&headers, &Uri::from_static("/")),
            Err(SessionError::NoSession)
        );
    }

    #[test]
    fn strip_removes_every_session_token() {
        let f = fixture();
        let token = f.codec.encode(&named("alice")).unwrap();
        let (mut headers, _) = request(Some(&token), Some(&token), None);
        headers.append(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        let mut uri: Uri = format!("/search?q=a%20b&gatehouse_session={}&page=2", token)
            .parse()
            .unwrap();

        f.chain.strip(&mut headers, &mut uri);

        let auth: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(auth, vec![&HeaderValue::from_static("Basic dXNlcjpwdw==")]);
        assert_eq!(headers[COOKIE], "theme=dark");
        assert_eq!(uri, "/search?q=a%20b&page=2");
        assert_eq!(f.chain.load(&headers, &uri), Err(SessionError::NoSession));
    }

    #[test]
    fn strip_drops_empty_query() {
        let f = fixture();
        let mut headers = HeaderMap::new();
        let mut uri = Uri::from_static("/path?gatehouse_session=abc");
        f.chain.strip(&mut headers, &mut uri);
        assert_eq!(uri, "/path");

        let mut untouched = Uri::from_static("/path?other=1");
        f.chain.strip(&mut headers, &mut untouched);
        assert_eq!(untouched, "/path?other=1");
    }
}
