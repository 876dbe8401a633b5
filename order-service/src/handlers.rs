use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use shared::channel::{Delivery, HandlerOutcome, MessageHandler};
use shared::messages::ReconciliationAlert;

use crate::store::OrderStore;

/// Consumes reconciliation alerts from inventory and flags the affected
/// order. The flag is the whole action; stock was never touched on the
/// inventory side, so there is nothing to compensate here.
pub struct ReconciliationHandler {
    store: Arc<OrderStore>,
}

impl ReconciliationHandler {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for ReconciliationHandler {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let alert: ReconciliationAlert = match serde_json::from_slice(delivery.payload()) {
            Ok(alert) => alert,
            Err(err) => {
                return HandlerOutcome::Malformed(format!("invalid reconciliation payload: {err}"))
            }
        };

        if self.store.mark_settlement_failed(alert.order_id) {
            error!(
                "order {} flagged for reconciliation: {}",
                alert.order_id, alert.reason
            );
        } else {
            warn!(
                "reconciliation alert for order {} ignored, order is not in Confirmed state",
                alert.order_id
            );
        }
        HandlerOutcome::Ok
    }
}
