//! HTTP middleware for the pool server.
//!
//! Provides request correlation ID tracking. Proof checks can take minutes,
//! so every log line emitted while serving one carries the request's ID.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for request correlation IDs.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Correlation ID stored in request extensions.
///
/// Distinct from the JSON-RPC `id`, which is chosen by the client per call.
#[derive(Clone, Debug)]
#[allow(dead_code)] // Field is public for handler access
pub struct CorrelationId(pub String);

/// Middleware that adds request correlation IDs to each request.
///
/// If the request includes an `X-Request-ID` header, that value is used.
/// Otherwise, a new UUIDv4 is generated.
///
/// The ID is:
/// - Stored in request extensions (accessible via `Extension<CorrelationId>`)
/// - Recorded on a tracing span wrapping the whole request
/// - Echoed back in the response `X-Request-ID` header
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(CorrelationId(request_id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
    );

    let mut response = next.run(request).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(X_REQUEST_ID.clone(), header_value);
    }

    response
}
