use crate::handlers::json_body;
use crate::models::user::normalize_email;
use crate::models::{document_id, LoginRequest, SignupRequest, UserResponse, USERS_COLLECTION};
use crate::startup::AppState;
use crate::utils::{hash_password, verify_password, Password};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use serde_json::json;
use service_core::error::AppError;
use validator::Validate;

const INVALID_CREDENTIALS: &str = "Invalid email or password";

pub fn signup_router() -> Router<AppState> {
    Router::new().route("/", post(signup))
}

pub fn login_router() -> Router<AppState> {
    Router::new().route("/", post(login))
}

async fn signup(
    State(state): State<AppState>,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    let email = normalize_email(&req.email);
    let store = state.connection.store()?;

    if store
        .find_one(USERS_COLLECTION, doc! { "email": email.as_str() })
        .await?
        .is_some()
    {
        return Err(AppError::Conflict(anyhow::anyhow!("Email already registered")));
    }

    let password_hash = hash_password(&Password::new(req.password))?;

    let mut user = doc! {
        "email": email.as_str(),
        "password_hash": password_hash,
        "created_at": BsonDateTime::now(),
    };
    if let Some(name) = &req.name {
        user.insert("name", name.trim());
    }

    // The unique email index turns a concurrent duplicate into a conflict too.
    let id = store
        .insert_document(USERS_COLLECTION, user)
        .await
        .map_err(|e| match e {
            AppError::Conflict(_) => AppError::Conflict(anyhow::anyhow!("Email already registered")),
            other => other,
        })?;

    tracing::info!(user_id = %id, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            id,
            name: req.name.map(|n| n.trim().to_string()),
            email,
        }),
    ))
}

async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let req = json_body(payload)?;
    req.validate()?;

    let email = normalize_email(&req.email);
    let store = state.connection.store()?;

    let Some(user) = store
        .find_one(USERS_COLLECTION, doc! { "email": email.as_str() })
        .await?
    else {
        return Err(AppError::Unauthorized(anyhow::anyhow!(INVALID_CREDENTIALS)));
    };

    let password_hash = user.get_str("password_hash").map_err(|_| {
        tracing::error!(email = %email, "Stored user has no password hash");
        AppError::Unauthorized(anyhow::anyhow!(INVALID_CREDENTIALS))
    })?;

    if verify_password(&Password::new(req.password), password_hash).is_err() {
        tracing::info!(email = %email, "Login rejected");
        return Err(AppError::Unauthorized(anyhow::anyhow!(INVALID_CREDENTIALS)));
    }

    let id = document_id(&user).unwrap_or_default();
    tracing::info!(user_id = %id, "User logged in");

    Ok(Json(json!({
        "message": "Login successful",
        "user": UserResponse {
            id,
            name: user.get_str("name").ok().map(str::to_string),
            email,
        },
    })))
}
