use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use shared::channel::ChannelClient;
use shared::messages::{SettlementEvent, SETTLEMENT_TOPIC};
use shared::reservation::{ReservationApi, ReserveError, ReserveRequest};

use crate::models::Order;
use crate::store::OrderStore;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error(transparent)]
    Rejected(#[from] ReserveError),
    #[error("reservation timed out")]
    ReserveTimeout,
}

#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// Upper bound on the in-band reservation call.
    pub reserve_timeout: Duration,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(3),
        }
    }
}

pub struct OrderService {
    store: Arc<OrderStore>,
    reservations: Arc<dyn ReservationApi>,
    client: Arc<ChannelClient>,
    config: OrderConfig,
}

impl OrderService {
    pub fn new(
        store: Arc<OrderStore>,
        reservations: Arc<dyn ReservationApi>,
        client: Arc<ChannelClient>,
        config: OrderConfig,
    ) -> Self {
        Self {
            store,
            reservations,
            client,
            config,
        }
    }

    /// Submit an order: hold stock first, then commit the order with its
    /// settlement event. An order is only Confirmed once the event is
    /// staged, so `Confirmed` always implies an eventual settlement
    /// delivery.
    pub async fn submit_order(&self, product_id: Uuid, quantity: u32) -> Result<Order, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity);
        }

        let mut order = Order::new(product_id, quantity);
        let request = ReserveRequest {
            product_id,
            quantity,
            idempotency_key: Uuid::new_v4(),
            order_id: order.id,
        };

        let grant = match timeout(
            self.config.reserve_timeout,
            self.reservations.reserve(request),
        )
        .await
        {
            Ok(Ok(grant)) => grant,
            Ok(Err(err)) => {
                info!("order {} rejected: {}", order.id, err);
                order.reject(err.to_string());
                self.store.insert(order);
                return Err(OrderError::Rejected(err));
            }
            Err(_) => {
                warn!(
                    "reservation for order {} timed out after {:?}",
                    order.id, self.config.reserve_timeout
                );
                order.reject("reservation timed out");
                self.store.insert(order);
                return Err(OrderError::ReserveTimeout);
            }
        };

        order.confirm(grant.reservation_id);
        let event = SettlementEvent {
            idempotency_key: grant.reservation_id,
            order_id: order.id,
            product_id,
            quantity,
        };
        let row_id = self.store.insert_with_event(order.clone(), event.clone());
        info!(
            "order {} confirmed with reservation {}",
            order.id, grant.reservation_id
        );

        // happy-path publish; the outbox processor retries on failure
        match self.client.publish_json(SETTLEMENT_TOPIC, &event).await {
            Ok(()) => self.store.mark_published(row_id),
            Err(err) => {
                self.store.record_attempt(row_id);
                warn!(
                    "settlement publish for order {} failed, outbox will retry: {}",
                    order.id, err
                );
            }
        }

        Ok(order)
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.store.order(id)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.store.orders()
    }
}
