pub mod health;
pub mod resources;
pub mod users;

pub use health::{demo_data, env_check, health_check, metrics_endpoint, readiness_check, root};

use axum::{extract::rejection::JsonRejection, Json};
use service_core::error::AppError;

/// Unwrap a JSON body, turning extractor rejections into JSON `400`s.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::BadRequest(anyhow::anyhow!(rejection.body_text())))
}
