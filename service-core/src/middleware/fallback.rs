//! Catch-all responses: unmatched routes and panicking handlers.

use crate::error::ErrorResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::any::Any;

pub const NOT_FOUND_MESSAGE: &str = "Route not found";
pub const PANIC_MESSAGE: &str = "Something went wrong!";

/// Router fallback for requests that match no route.
pub async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(NOT_FOUND_MESSAGE)),
    )
}

/// Response builder for `tower_http::catch_panic::CatchPanicLayer::custom`.
///
/// The panic payload is logged (the panic hook has already printed its
/// location); the client only sees a generic message.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };

    tracing::error!(panic = %detail, "Request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(PANIC_MESSAGE)),
    )
        .into_response()
}
