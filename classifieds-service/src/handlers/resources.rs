//! Pass-through document collections: categories, areas, advertisements.

use crate::handlers::json_body;
use crate::models::document_to_json;
use crate::startup::AppState;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use mongodb::bson::{self, DateTime as BsonDateTime, Document};
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;

pub const MAX_LIST_LIMIT: i64 = 100;

/// A collection exposed as a create/list resource.
pub trait Collection: Send + Sync + 'static {
    const NAME: &'static str;
}

pub struct Categories;
pub struct Areas;
pub struct Advertisements;

impl Collection for Categories {
    const NAME: &'static str = "categories";
}

impl Collection for Areas {
    const NAME: &'static str = "areas";
}

impl Collection for Advertisements {
    const NAME: &'static str = "advertisements";
}

pub fn router<C: Collection>() -> Router<AppState> {
    Router::new().route("/", get(list_documents::<C>).post(create_document::<C>))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

async fn create_document<C: Collection>(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let body = json_body(payload)?;
    let mut document = match body {
        Value::Object(_) => bson::to_document(&body)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid document: {}", e)))?,
        _ => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Request body must be a JSON object"
            )))
        }
    };
    // Ids are always assigned by the store.
    document.remove("_id");
    document.insert("created_at", BsonDateTime::now());

    let store = state.connection.store()?;
    let id = store.insert_document(C::NAME, document).await?;

    tracing::info!(collection = C::NAME, id = %id, "Document created");

    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn list_documents<C: Collection>(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let limit = params
        .limit
        .unwrap_or(MAX_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let store = state.connection.store()?;
    let documents: Vec<Value> = store
        .find_documents(C::NAME, Document::new(), limit)
        .await?
        .into_iter()
        .map(document_to_json)
        .collect();

    Ok(Json(json!({ "count": documents.len(), "items": documents })))
}
