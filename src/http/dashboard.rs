//! Gateway endpoints served on every host under `/.gatehouse`.
//!
//! # Responsibilities
//! - `GET /.gatehouse/`: identity of the current session as JSON
//! - `GET /.gatehouse/callback`: accept a session token from the authenticate
//!   service, store it as the session cookie and redirect back
//! - `GET|POST /.gatehouse/sign_out`: clear the session cookie and hand off to
//!   the authenticate service's sign-out
//!
//! # Design Decisions
//! - Callback tokens are decoded and verified before they are stored
//! - Redirect targets must be hosts this gateway serves

use std::collections::HashMap;

use axum::extract::Request;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use url::Url;

use crate::proxy::authority::request_host;
use crate::proxy::{ProxyError, RoutingTable};
use crate::sessions::state::unix_now;
use crate::sessions::SessionValue;

pub const DASHBOARD_PREFIX: &str = "/.gatehouse";

/// Path on the authenticate service that ends a session.
pub const SIGN_OUT_PATH: &str = "/.gatehouse/sign_out";

const REDIRECT_PARAM: &str = "redirect_uri";

pub fn is_dashboard_path(path: &str) -> bool {
    path == DASHBOARD_PREFIX
        || path
            .strip_prefix(DASHBOARD_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn handle(table: &RoutingTable, request: Request) -> Response {
    let sub_path = request
        .uri()
        .path()
        .strip_prefix(DASHBOARD_PREFIX)
        .unwrap_or_default()
        .to_string();

    match (request.method().clone(), sub_path.as_str()) {
        (Method::GET, "" | "/") => user_info(table, &request),
        (Method::GET, "/callback") => callback(table, &request),
        (Method::GET | Method::POST, "/sign_out") => sign_out(table, &request),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn user_info(table: &RoutingTable, request: &Request) -> Response {
    match table.context().loaders.load(request.headers(), request.uri()) {
        Ok(state) => ([(header::CACHE_CONTROL, "no-store")], Json(state)).into_response(),
        Err(e) => {
            tracing::debug!(error = %e, "Dashboard request without a valid session");
            ProxyError::Unauthenticated.into_response()
        }
    }
}

fn callback(table: &RoutingTable, request: &Request) -> Response {
    let context = table.context();
    let params = query_params(request);

    let Some(token) = params.get(&context.query_param) else {
        return bad_request("missing session token");
    };
    let state = match context.codec.decode(token) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected callback session token");
            return bad_request("invalid session token");
        }
    };
    if let Err(e) = state.verify(unix_now()) {
        tracing::info!(error = %e, user = %state.user_id(), "Rejected callback session");
        return bad_request("invalid session token");
    }

    let Some(target) = params.get(REDIRECT_PARAM).and_then(|raw| served_url(table, raw)) else {
        return bad_request("invalid redirect_uri");
    };

    let mut cookies = HeaderMap::new();
    if let Err(e) = context
        .cookie_store
        .save_session(&mut cookies, request.headers(), SessionValue::Text(token.as_str()))
    {
        tracing::warn!(error = %e, user = %state.user_id(), "Could not store session cookie");
        return bad_request("session cannot be stored");
    }

    tracing::info!(
        user = %state.user_id(),
        host = %request_host(request),
        "Session established"
    );
    let mut response = redirect(target.as_str());
    for value in cookies.get_all(header::SET_COOKIE) {
        response.headers_mut().append(header::SET_COOKIE, value.clone());
    }
    response
}

fn sign_out(table: &RoutingTable, request: &Request) -> Response {
    let context = table.context();
    let params = query_params(request);

    let mut location = context.authenticate_url.clone();
    location.set_path(SIGN_OUT_PATH);
    location.set_query(None);
    if let Some(target) = params.get(REDIRECT_PARAM).and_then(|raw| served_url(table, raw)) {
        location.query_pairs_mut().append_pair(REDIRECT_PARAM, target.as_str());
    }

    let mut response = redirect(location.as_str());
    context
        .cookie_store
        .clear_session(response.headers_mut(), request.headers());
    response
}

fn query_params(request: &Request) -> HashMap<String, String> {
    request
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Parse `raw` and accept it only if it points at a host this table serves.
fn served_url(table: &RoutingTable, raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return None,
    };
    table.serves(&host).then_some(url)
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}
