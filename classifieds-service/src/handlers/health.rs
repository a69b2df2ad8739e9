use crate::config::ClassifiedsConfig;
use crate::services::get_metrics;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

pub const ROOT_MESSAGE: &str = "Portfolio Backend - Pak Classified - Running Successfully!";

pub async fn root() -> &'static str {
    ROOT_MESSAGE
}

/// Liveness plus store readiness, with an active ping when readiness claims
/// a connection.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.connection.health_check().await)
}

/// Readiness probe for orchestrators: 200 only when the store answers a ping.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.connection.health_check().await.actually_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Presence {
    Set,
    Missing,
}

impl Presence {
    fn of<T>(value: &Option<T>) -> Self {
        if value.is_some() {
            Presence::Set
        } else {
            Presence::Missing
        }
    }
}

/// Which deployment variables are configured. Credentials are reported by
/// presence only.
#[derive(Debug, Serialize)]
pub struct EnvCheckReport {
    #[serde(rename = "CLOUDINARY_CLOUD_NAME")]
    pub cloudinary_cloud_name: Option<String>,
    #[serde(rename = "CLOUDINARY_API_KEY")]
    pub cloudinary_api_key: Presence,
    #[serde(rename = "CLOUDINARY_API_SECRET")]
    pub cloudinary_api_secret: Presence,
    #[serde(rename = "MONGODB_URI")]
    pub mongodb_uri: Presence,
    #[serde(rename = "ENVIRONMENT")]
    pub environment: String,
}

impl From<&ClassifiedsConfig> for EnvCheckReport {
    fn from(config: &ClassifiedsConfig) -> Self {
        Self {
            cloudinary_cloud_name: config.cloudinary.cloud_name.clone(),
            cloudinary_api_key: Presence::of(&config.cloudinary.api_key),
            cloudinary_api_secret: Presence::of(&config.cloudinary.api_secret),
            mongodb_uri: Presence::of(&config.mongodb.uri),
            environment: config.environment.clone(),
        }
    }
}

pub async fn env_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(EnvCheckReport::from(state.config.as_ref()))
}

/// Static showcase payload served by on-demand deployments.
pub async fn demo_data() -> impl IntoResponse {
    Json(json!({
        "project": "Pak Classified",
        "description": "Classifieds portfolio backend: post and browse advertisements by category and city area",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "resources": [
            { "path": "/createCategory", "methods": ["GET", "POST"], "description": "Advertisement categories" },
            { "path": "/createArea", "methods": ["GET", "POST"], "description": "City areas" },
            { "path": "/createAdvertisement", "methods": ["GET", "POST"], "description": "Advertisements" },
            { "path": "/createuser", "methods": ["POST"], "description": "Signup" },
            { "path": "/createlogin", "methods": ["POST"], "description": "Login" }
        ],
        "diagnostics": ["/health", "/ready", "/env-check", "/metrics"]
    }))
}
