use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use shared::channel::{ChannelClient, ChannelError, Delivery, HandlerOutcome, MessageHandler};
use shared::messages::{ReconciliationAlert, SettlementEvent, RECONCILE_TOPIC};

use crate::store::{InventoryStore, SettleError, SettleOutcome};

/// Consumes settlement events from the order side. Settlement is idempotent:
/// redeliveries of an applied settlement ack without touching stock. A
/// settlement that can no longer be applied raises a reconciliation alert
/// instead of mutating anything.
pub struct SettlementHandler {
    store: Arc<InventoryStore>,
    client: Arc<ChannelClient>,
}

impl SettlementHandler {
    pub fn new(store: Arc<InventoryStore>, client: Arc<ChannelClient>) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl MessageHandler for SettlementHandler {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let event: SettlementEvent = match serde_json::from_slice(delivery.payload()) {
            Ok(event) => event,
            Err(err) => {
                return HandlerOutcome::Malformed(format!("invalid settlement payload: {err}"))
            }
        };

        match self.store.settle(event.idempotency_key) {
            Ok(SettleOutcome::Applied { quantity }) => {
                info!(
                    "settled reservation {} for order {} ({} units)",
                    event.idempotency_key, event.order_id, quantity
                );
                HandlerOutcome::Ok
            }
            Ok(SettleOutcome::AlreadySettled) => {
                info!(
                    "settlement for reservation {} already applied, ignoring redelivery",
                    event.idempotency_key
                );
                HandlerOutcome::Ok
            }
            Err(err @ (SettleError::Unknown(_) | SettleError::Released(_))) => {
                error!(
                    "settlement for order {} needs reconciliation: {}",
                    event.order_id, err
                );
                let alert = ReconciliationAlert {
                    idempotency_key: event.idempotency_key,
                    order_id: event.order_id,
                    product_id: event.product_id,
                    quantity: event.quantity,
                    reason: err.to_string(),
                };
                match self.client.publish_json(RECONCILE_TOPIC, &alert).await {
                    Ok(()) => HandlerOutcome::Ok,
                    Err(ChannelError::Closed) => {
                        error!(
                            "reconciliation alert for order {} dropped during shutdown",
                            event.order_id
                        );
                        HandlerOutcome::Ok
                    }
                    Err(err) => {
                        HandlerOutcome::Transient(format!("could not publish alert: {err}"))
                    }
                }
            }
            Err(SettleError::Conflict) => {
                HandlerOutcome::Transient("product row contention".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::channel::InMemoryBroker;
    use shared::messages::SETTLEMENT_TOPIC;
    use uuid::Uuid;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        store: Arc<InventoryStore>,
        handler: SettlementHandler,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InventoryStore::new());
        let client = Arc::new(ChannelClient::new(Arc::clone(&broker)));
        let handler = SettlementHandler::new(Arc::clone(&store), client);
        Fixture {
            broker,
            store,
            handler,
        }
    }

    async fn deliver(fixture: &Fixture, event: &SettlementEvent) -> HandlerOutcome {
        fixture
            .broker
            .publish(SETTLEMENT_TOPIC, serde_json::to_vec(event).unwrap())
            .unwrap();
        let mut sub = fixture.broker.subscribe(SETTLEMENT_TOPIC);
        let delivery = sub.recv().await.unwrap();
        let outcome = fixture.handler.handle(&delivery).await;
        delivery.ack();
        outcome
    }

    fn held_event(fixture: &Fixture, stock: u32, quantity: u32) -> SettlementEvent {
        let product = fixture.store.insert_product("widget", stock);
        let key = Uuid::new_v4();
        let order_id = Uuid::new_v4();
        let expires = Utc::now() + chrono::Duration::minutes(5);
        fixture
            .store
            .reserve(product.id, quantity, key, order_id, expires)
            .unwrap();
        SettlementEvent {
            idempotency_key: key,
            order_id,
            product_id: product.id,
            quantity,
        }
    }

    #[tokio::test]
    async fn settlement_decrements_stock_once() {
        let fixture = fixture();
        let event = held_event(&fixture, 10, 4);

        assert_eq!(deliver(&fixture, &event).await, HandlerOutcome::Ok);
        assert_eq!(deliver(&fixture, &event).await, HandlerOutcome::Ok);

        let product = fixture.store.product(event.product_id).unwrap();
        assert_eq!(product.total_quantity, 6);
        assert_eq!(product.reserved_quantity, 0);
        assert_eq!(product.available_quantity, 6);
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let fixture = fixture();
        fixture
            .broker
            .publish(SETTLEMENT_TOPIC, b"not json at all".to_vec())
            .unwrap();
        let mut sub = fixture.broker.subscribe(SETTLEMENT_TOPIC);
        let delivery = sub.recv().await.unwrap();
        let outcome = fixture.handler.handle(&delivery).await;
        delivery.ack();
        assert!(matches!(outcome, HandlerOutcome::Malformed(_)));
    }

    #[tokio::test]
    async fn unknown_reservation_raises_a_reconciliation_alert() {
        let fixture = fixture();
        let mut alerts = fixture.broker.subscribe(RECONCILE_TOPIC);
        let event = SettlementEvent {
            idempotency_key: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity: 2,
        };

        assert_eq!(deliver(&fixture, &event).await, HandlerOutcome::Ok);

        let delivery = alerts.recv().await.unwrap();
        let alert: ReconciliationAlert = serde_json::from_slice(delivery.payload()).unwrap();
        delivery.ack();
        assert_eq!(alert.order_id, event.order_id);
        assert_eq!(alert.idempotency_key, event.idempotency_key);
    }

    #[tokio::test]
    async fn released_reservation_raises_alert_and_leaves_stock_alone() {
        let fixture = fixture();
        let mut alerts = fixture.broker.subscribe(RECONCILE_TOPIC);
        let event = held_event(&fixture, 10, 4);
        fixture.store.release(event.idempotency_key).unwrap();

        assert_eq!(deliver(&fixture, &event).await, HandlerOutcome::Ok);

        let delivery = alerts.recv().await.unwrap();
        let alert: ReconciliationAlert = serde_json::from_slice(delivery.payload()).unwrap();
        delivery.ack();
        assert!(alert.reason.contains("released"));

        let product = fixture.store.product(event.product_id).unwrap();
        assert_eq!(product.available_quantity, 10);
        assert_eq!(product.total_quantity, 10);
    }
}
