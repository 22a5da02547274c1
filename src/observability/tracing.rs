//! Request spans.
//!
//! Every request gets one span carrying the request ID assigned by the
//! server's request-id layer, so pipeline and upstream log events correlate.

use axum::body::Body;
use axum::http::Request;
use tracing::Span;

use crate::http::request::request_id;

/// Span for one gateway request, used as the trace layer's `make_span_with`.
pub fn request_span(request: &Request<Body>) -> Span {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    tracing::info_span!(
        "request",
        request_id = %request_id(request.headers()).unwrap_or("unknown"),
        method = %request.method(),
        host = %host,
        path = %request.uri().path(),
    )
}
