use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use shared::reservation::{ReservationApi, ReservationGrant, ReserveError, ReserveRequest};

use crate::models::{Product, Reservation};
use crate::store::InventoryStore;

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// How long a hold stays live before the sweeper releases it.
    pub reservation_ttl: Duration,
    /// Cadence of the expiry sweeper.
    pub sweep_interval: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

pub struct InventoryService {
    store: Arc<InventoryStore>,
    config: InventoryConfig,
}

impl InventoryService {
    pub fn new(store: Arc<InventoryStore>, config: InventoryConfig) -> Self {
        Self { store, config }
    }

    pub fn add_product(&self, name: impl Into<String>, quantity: u32) -> Product {
        let product = self.store.insert_product(name, quantity);
        info!(
            "added product {} ({}) with {} units",
            product.name, product.id, product.total_quantity
        );
        product
    }

    pub fn product(&self, id: Uuid) -> Option<Product> {
        self.store.product(id)
    }

    pub fn products(&self) -> Vec<Product> {
        self.store.products()
    }

    pub fn reservation(&self, key: Uuid) -> Option<Reservation> {
        self.store.reservation(key)
    }

    /// Release every overdue hold. Returns how many were released.
    pub fn sweep_expired(&self) -> usize {
        let released = self.store.expire_due(Utc::now());
        for reservation in &released {
            warn!(
                "released expired reservation {} for order {} ({} units of {})",
                reservation.id, reservation.order_id, reservation.quantity, reservation.product_id
            );
        }
        released.len()
    }

    /// Periodically release overdue holds until shutdown is signalled.
    pub async fn run_expiry_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_expired();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("expiry sweeper stopped");
    }
}

#[async_trait]
impl ReservationApi for InventoryService {
    async fn reserve(&self, request: ReserveRequest) -> Result<ReservationGrant, ReserveError> {
        let ttl = chrono::Duration::milliseconds(self.config.reservation_ttl.as_millis() as i64);
        let reservation = self.store.reserve(
            request.product_id,
            request.quantity,
            request.idempotency_key,
            request.order_id,
            Utc::now() + ttl,
        )?;
        info!(
            "held {} units of {} for order {} (reservation {}, expires {})",
            reservation.quantity,
            reservation.product_id,
            reservation.order_id,
            reservation.id,
            reservation.expires_at
        );
        Ok(ReservationGrant {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
        })
    }
}
