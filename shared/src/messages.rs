use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic carrying settlement events from the order service to inventory.
pub const SETTLEMENT_TOPIC: &str = "order_settlement";

/// Topic carrying reconciliation alerts from inventory back to the order
/// service, for settlements that can no longer be applied.
pub const RECONCILE_TOPIC: &str = "order_settlement.reconcile";

/// Dead-letter topic paired with `topic`.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// Published by the order service when an order is confirmed. Instructs
/// inventory to turn the reservation identified by `idempotency_key` into a
/// permanent stock decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub idempotency_key: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
}

/// Raised by inventory when a settlement arrives for a reservation that was
/// already released or never existed. Stock is left untouched; the order side
/// decides what to do with the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub idempotency_key: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
    pub reason: String,
}

/// Envelope stored on a dead-letter topic for messages that could not be
/// decoded or processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub payload: String,
    pub reason: String,
    pub attempt: u32,
}

impl DeadLetter {
    pub fn new(payload: &[u8], reason: impl Into<String>, attempt: u32) -> Self {
        Self {
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: reason.into(),
            attempt,
        }
    }
}
