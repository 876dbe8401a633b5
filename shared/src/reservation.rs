use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Request to place a tentative hold on stock. The `idempotency_key` doubles
/// as the reservation id; replaying a request with the same key while the
/// hold is live returns the original grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub product_id: Uuid,
    pub quantity: u32,
    pub idempotency_key: Uuid,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationGrant {
    pub reservation_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReserveError {
    #[error("insufficient stock for product {product_id}: {available} available, {requested} requested")]
    InsufficientStock {
        product_id: Uuid,
        available: u32,
        requested: u32,
    },
    #[error("product {0} not found")]
    NotFound(Uuid),
    #[error("duplicate reservation key {0}")]
    DuplicateKey(Uuid),
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous edge of the inventory service, called in-band during order
/// submission. Settlement and release travel over the message channel
/// instead.
#[async_trait]
pub trait ReservationApi: Send + Sync {
    /// Hold `quantity` units of the product until the grant expires or a
    /// settlement arrives. Must commit atomically: a cancelled call either
    /// returns the grant or leaves no hold behind. `quantity` must be at
    /// least 1.
    async fn reserve(&self, request: ReserveRequest) -> Result<ReservationGrant, ReserveError>;
}
