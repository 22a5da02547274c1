//! Request identification.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) unless the client sent one
//! - Propagate the ID onto the response
//! - Expose the ID to spans and log events
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The ID is forwarded upstream with the rest of the request headers

use axum::http::{HeaderMap, HeaderName};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(X_REQUEST_ID)
}

/// The request ID, if one has been assigned.
pub fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(&X_REQUEST_ID).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, Response};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    use super::*;

    #[tokio::test]
    async fn assigns_and_propagates_id() {
        let service = ServiceBuilder::new()
            .layer(set_request_id_layer())
            .layer(propagate_request_id_layer())
            .service(service_fn(|request: Request<Body>| async move {
                assert!(request_id(request.headers()).is_some());
                Ok::<_, std::convert::Infallible>(Response::new(Body::empty()))
            }));

        let response = service
            .clone()
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();
        let id = request_id(response.headers()).unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());

        let request = Request::builder()
            .header(X_REQUEST_ID, "client-supplied")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(request_id(response.headers()), Some("client-supplied"));
    }
}
