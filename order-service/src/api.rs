use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::reservation::ReserveError;

use crate::models::Order;
use crate::service::{OrderError, OrderService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrderService>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            OrderError::InvalidQuantity => (StatusCode::BAD_REQUEST, "INVALID_QUANTITY"),
            OrderError::Rejected(ReserveError::InsufficientStock { .. }) => {
                (StatusCode::CONFLICT, "INSUFFICIENT_STOCK")
            }
            OrderError::Rejected(ReserveError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "PRODUCT_NOT_FOUND")
            }
            OrderError::Rejected(ReserveError::DuplicateKey(_)) => {
                (StatusCode::CONFLICT, "DUPLICATE_RESERVATION")
            }
            OrderError::Rejected(ReserveError::Unavailable(_)) | OrderError::ReserveTimeout => {
                (StatusCode::SERVICE_UNAVAILABLE, "INVENTORY_UNAVAILABLE")
            }
        };
        let body = Json(ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", axum::routing::post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .with_state(state)
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<Order>, OrderError> {
    let order = state
        .service
        .submit_order(request.product_id, request.quantity)
        .await?;
    Ok(Json(order))
}

pub async fn list_orders(State(state): State<AppState>) -> Json<Vec<Order>> {
    Json(state.service.orders())
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, (StatusCode, Json<ErrorResponse>)> {
    match state.service.order(id) {
        Some(order) => Ok(Json(order)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "ORDER_NOT_FOUND".to_string(),
                message: format!("order {id} not found"),
            }),
        )),
    }
}
