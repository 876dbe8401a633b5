use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stock row for a single product. `available + reserved == total` holds at
/// every committed state; settlement shrinks `total`, release moves units
/// back from `reserved` to `available`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub available_quantity: u32,
    pub reserved_quantity: u32,
    pub total_quantity: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: impl Into<String>, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            available_quantity: quantity,
            reserved_quantity: 0,
            total_quantity: quantity,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_balanced(&self) -> bool {
        self.available_quantity + self.reserved_quantity == self.total_quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Held,
    Settled,
    Released,
}

/// A hold on stock. The id is the idempotency key the order side supplied,
/// so replays and settlements address the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub quantity: u32,
    pub state: ReservationState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_product_starts_fully_available() {
        let product = Product::new("widget", 7);
        assert_eq!(product.available_quantity, 7);
        assert_eq!(product.reserved_quantity, 0);
        assert_eq!(product.total_quantity, 7);
        assert!(product.is_balanced());
    }
}
