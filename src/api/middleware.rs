//! Request-id middleware for the diagnostic HTTP surface (section 6,
//! "Diagnostic HTTP surface"), grounded in the teacher's
//! `api::middleware::request_id_middleware`.

use axum::{extract::Request, http::header, http::HeaderValue, middleware::Next, response::Response};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Accepts an inbound `X-Request-Id` or generates a UUIDv4, attaches it to
/// the current tracing span, and echoes it back in the response header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(request_id.clone());

    let span = tracing::Span::current();
    span.record("request_id", tracing::field::display(&request_id));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static("x-request-id"), value);
    }
    response
}
