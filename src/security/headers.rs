//! Header manipulation for forwarded requests.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers, including any named in `Connection`
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Remove client-supplied identity headers before a pipeline sets them
//!
//! # Design Decisions
//! - X-Forwarded-For is appended to, never replaced
//! - Identity headers are only ever trusted when the gateway wrote them

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::security::signer::ASSERTION_HEADER;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

pub const USER_ID_HEADER: &str = "x-gatehouse-authenticated-user-id";
pub const EMAIL_HEADER: &str = "x-gatehouse-authenticated-user-email";
pub const GROUPS_HEADER: &str = "x-gatehouse-authenticated-user-groups";

static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including those listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// True for an HTTP/1.1 `Connection: upgrade` request naming a protocol.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

/// Append the client to X-Forwarded-For and record the original host and scheme.
pub fn set_forwarded(headers: &mut HeaderMap, client: Option<IpAddr>, host: Option<&str>, proto: &str) {
    if let Some(ip) = client {
        let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(proto) = HeaderValue::from_str(proto) {
        headers.insert(X_FORWARDED_PROTO, proto);
    }
}

/// Drop identity and assertion headers a client may have forged.
pub fn remove_identity_headers(headers: &mut HeaderMap) {
    for name in [USER_ID_HEADER, EMAIL_HEADER, GROUPS_HEADER, ASSERTION_HEADER] {
        headers.remove(name);
    }
}
