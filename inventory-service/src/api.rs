use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Product;
use crate::service::InventoryService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InventoryService>,
}

#[derive(Debug, Deserialize)]
pub struct AddProductRequest {
    pub name: String,
    pub quantity: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/products", axum::routing::post(add_product).get(list_products))
        .route("/products/:id", get(get_product))
        .with_state(state)
}

pub async fn add_product(
    State(state): State<AppState>,
    Json(request): Json<AddProductRequest>,
) -> Json<Product> {
    Json(state.service.add_product(request.name, request.quantity))
}

pub async fn list_products(State(state): State<AppState>) -> Json<Vec<Product>> {
    Json(state.service.products())
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Product>, (StatusCode, Json<ErrorResponse>)> {
    match state.service.product(id) {
        Some(product) => Ok(Json(product)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "PRODUCT_NOT_FOUND".to_string(),
                message: format!("product {id} not found"),
            }),
        )),
    }
}
