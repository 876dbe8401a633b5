use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Submission accepted, reservation still in flight.
    Pending,
    /// Stock is held and the settlement event is committed for delivery.
    Confirmed,
    /// No stock was held. `rejection_reason` says why.
    Rejected,
    /// Confirmed earlier, but inventory could not apply the settlement.
    /// Terminal until an operator intervenes.
    SettlementFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
    pub status: OrderStatus,
    pub reservation_id: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(product_id: Uuid, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            product_id,
            quantity,
            status: OrderStatus::Pending,
            reservation_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn confirm(&mut self, reservation_id: Uuid) {
        debug_assert_eq!(self.status, OrderStatus::Pending);
        self.status = OrderStatus::Confirmed;
        self.reservation_id = Some(reservation_id);
        self.updated_at = Utc::now();
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        debug_assert_eq!(self.status, OrderStatus::Pending);
        self.status = OrderStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }

    /// Flag a settlement failure. Only legal from `Confirmed`; returns
    /// whether the transition happened.
    pub fn mark_settlement_failed(&mut self) -> bool {
        if self.status != OrderStatus::Confirmed {
            return false;
        }
        self.status = OrderStatus::SettlementFailed;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_records_the_reservation() {
        let mut order = Order::new(Uuid::new_v4(), 2);
        assert_eq!(order.status, OrderStatus::Pending);

        let reservation_id = Uuid::new_v4();
        order.confirm(reservation_id);
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.reservation_id, Some(reservation_id));
    }

    #[test]
    fn settlement_failed_only_from_confirmed() {
        let mut rejected = Order::new(Uuid::new_v4(), 2);
        rejected.reject("no stock");
        assert!(!rejected.mark_settlement_failed());
        assert_eq!(rejected.status, OrderStatus::Rejected);

        let mut confirmed = Order::new(Uuid::new_v4(), 2);
        confirmed.confirm(Uuid::new_v4());
        assert!(confirmed.mark_settlement_failed());
        assert_eq!(confirmed.status, OrderStatus::SettlementFailed);

        // repeat flags are no-ops
        assert!(!confirmed.mark_settlement_failed());
    }
}
