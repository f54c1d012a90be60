//! Maps `ConError` onto the HTTP status/envelope shape of spec §7: match a
//! typed error into an `HttpResponse` carrying a JSON body, built on the
//! `ErrorEnvelope` wrapper from `konsul-common` with an `X-RateLimit-Reset`
//! header on 429 responses.

use actix_web::{HttpRequest, HttpResponse, http::StatusCode};
use konsul_common::{ConError, ErrorEnvelope, ErrorKind};

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::CasConflict => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::TooManyWatchers => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders `err` as the JSON envelope of spec §7, deriving `path` from the
/// request and an optional `X-Request-Id` header as `request_id`.
pub fn render(req: &HttpRequest, err: &ConError) -> HttpResponse {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let envelope = ErrorEnvelope::new(err, req.path(), request_id);
    let status = status_for(envelope.error);

    let mut builder = HttpResponse::build(status);
    if let ConError::RateLimited { retry_after_secs } = err {
        builder.insert_header(("Retry-After", format!("{}", retry_after_secs.ceil() as u64)));
        builder.insert_header(("X-RateLimit-Reset", format!("{retry_after_secs:.3}")));
    }
    builder.json(envelope)
}
