//! In-memory stock store.
//!
//! Product rows carry a version counter and are only updated through a
//! compare-and-swap, so concurrent reservations against the same product
//! serialize on the row without a global lock. The reservation table is the
//! idempotency ledger: every hold is keyed by the order side's idempotency
//! key and walks Held -> Settled or Held -> Released exactly once.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use shared::reservation::ReserveError;

use crate::models::{Product, Reservation, ReservationState};

/// Bound on compare-and-swap retries before a conflict is surfaced to the
/// caller as retryable.
pub const MAX_CAS_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The held units were consumed; total stock shrank.
    Applied { quantity: u32 },
    /// A previous settlement already consumed this hold.
    AlreadySettled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettleError {
    #[error("no reservation for key {0}")]
    Unknown(Uuid),
    #[error("reservation {0} was already released")]
    Released(Uuid),
    #[error("conflicting product updates, retries exhausted")]
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The held units went back to available stock.
    Released { quantity: u32 },
    /// The hold was already released.
    AlreadyReleased,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("no reservation for key {0}")]
    Unknown(Uuid),
    #[error("reservation {0} is already settled")]
    AlreadySettled(Uuid),
    #[error("conflicting product updates, retries exhausted")]
    Conflict,
}

#[derive(Debug, Clone)]
struct VersionedProduct {
    version: u64,
    product: Product,
}

#[derive(Debug, Default)]
struct ReservationTable {
    by_key: HashMap<Uuid, Reservation>,
    /// Live holds indexed by (order, product); at most one per pair.
    live_by_order: HashMap<(Uuid, Uuid), Uuid>,
}

#[derive(Debug, Default)]
pub struct InventoryStore {
    products: RwLock<HashMap<Uuid, VersionedProduct>>,
    reservations: Mutex<ReservationTable>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_product(&self, name: impl Into<String>, quantity: u32) -> Product {
        let product = Product::new(name, quantity);
        self.products.write().unwrap().insert(
            product.id,
            VersionedProduct {
                version: 0,
                product: product.clone(),
            },
        );
        product
    }

    pub fn product(&self, id: Uuid) -> Option<Product> {
        self.products
            .read()
            .unwrap()
            .get(&id)
            .map(|row| row.product.clone())
    }

    pub fn products(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self
            .products
            .read()
            .unwrap()
            .values()
            .map(|row| row.product.clone())
            .collect();
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        products
    }

    pub fn reservation(&self, key: Uuid) -> Option<Reservation> {
        self.reservations.lock().unwrap().by_key.get(&key).cloned()
    }

    fn snapshot(&self, id: Uuid) -> Option<VersionedProduct> {
        self.products.read().unwrap().get(&id).cloned()
    }

    /// Install `product` iff the row's version still matches. The version is
    /// bumped on success, failing every other writer's pending swap.
    fn compare_and_swap(&self, id: Uuid, expected_version: u64, mut product: Product) -> bool {
        let mut rows = self.products.write().unwrap();
        match rows.get_mut(&id) {
            Some(row) if row.version == expected_version => {
                debug_assert!(product.is_balanced());
                product.updated_at = Utc::now();
                row.version += 1;
                row.product = product;
                true
            }
            _ => false,
        }
    }

    /// Move `quantity` from available to reserved and record a Held
    /// reservation under `key`. Replaying a key with a live hold returns the
    /// original reservation unchanged.
    pub fn reserve(
        &self,
        product_id: Uuid,
        quantity: u32,
        key: Uuid,
        order_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Reservation, ReserveError> {
        debug_assert!(quantity > 0);
        for _ in 0..MAX_CAS_RETRIES {
            {
                let table = self.reservations.lock().unwrap();
                if let Some(existing) = table.by_key.get(&key) {
                    return match existing.state {
                        ReservationState::Held => Ok(existing.clone()),
                        _ => Err(ReserveError::DuplicateKey(key)),
                    };
                }
                if table.live_by_order.contains_key(&(order_id, product_id)) {
                    return Err(ReserveError::DuplicateKey(key));
                }
            }

            let Some(row) = self.snapshot(product_id) else {
                return Err(ReserveError::NotFound(product_id));
            };
            if row.product.available_quantity < quantity {
                return Err(ReserveError::InsufficientStock {
                    product_id,
                    available: row.product.available_quantity,
                    requested: quantity,
                });
            }

            let mut moved = row.product.clone();
            moved.available_quantity -= quantity;
            moved.reserved_quantity += quantity;
            if !self.compare_and_swap(product_id, row.version, moved) {
                continue;
            }

            // stock is moved; record the hold, or undo the move if another
            // task recorded a conflicting one while we were swapping
            let now = Utc::now();
            let reservation = Reservation {
                id: key,
                product_id,
                order_id,
                quantity,
                state: ReservationState::Held,
                expires_at,
                created_at: now,
                updated_at: now,
            };
            {
                let mut table = self.reservations.lock().unwrap();
                if let Some(existing) = table.by_key.get(&key).cloned() {
                    drop(table);
                    self.return_to_available(product_id, quantity);
                    return match existing.state {
                        ReservationState::Held => Ok(existing),
                        _ => Err(ReserveError::DuplicateKey(key)),
                    };
                }
                if table.live_by_order.contains_key(&(order_id, product_id)) {
                    drop(table);
                    self.return_to_available(product_id, quantity);
                    return Err(ReserveError::DuplicateKey(key));
                }
                table.by_key.insert(key, reservation.clone());
                table.live_by_order.insert((order_id, product_id), key);
            }
            return Ok(reservation);
        }
        Err(ReserveError::Unavailable(format!(
            "conflicting updates on product {product_id}, {MAX_CAS_RETRIES} retries exhausted"
        )))
    }

    /// Consume a hold for good: reserved and total both shrink. Safe to call
    /// any number of times per key.
    pub fn settle(&self, key: Uuid) -> Result<SettleOutcome, SettleError> {
        let mut table = self.reservations.lock().unwrap();
        let Some(reservation) = table.by_key.get(&key).cloned() else {
            return Err(SettleError::Unknown(key));
        };
        match reservation.state {
            ReservationState::Settled => return Ok(SettleOutcome::AlreadySettled),
            ReservationState::Released => return Err(SettleError::Released(key)),
            ReservationState::Held => {}
        }

        for _ in 0..MAX_CAS_RETRIES {
            let Some(row) = self.snapshot(reservation.product_id) else {
                return Err(SettleError::Unknown(key));
            };
            let mut product = row.product.clone();
            product.reserved_quantity = product.reserved_quantity.saturating_sub(reservation.quantity);
            product.total_quantity = product.total_quantity.saturating_sub(reservation.quantity);
            if self.compare_and_swap(reservation.product_id, row.version, product) {
                if let Some(entry) = table.by_key.get_mut(&key) {
                    entry.state = ReservationState::Settled;
                    entry.updated_at = Utc::now();
                }
                table
                    .live_by_order
                    .remove(&(reservation.order_id, reservation.product_id));
                return Ok(SettleOutcome::Applied {
                    quantity: reservation.quantity,
                });
            }
        }
        Err(SettleError::Conflict)
    }

    /// Return a hold's units to available stock. Safe to call any number of
    /// times per key.
    pub fn release(&self, key: Uuid) -> Result<ReleaseOutcome, ReleaseError> {
        let mut table = self.reservations.lock().unwrap();
        let Some(reservation) = table.by_key.get(&key).cloned() else {
            return Err(ReleaseError::Unknown(key));
        };
        match reservation.state {
            ReservationState::Released => return Ok(ReleaseOutcome::AlreadyReleased),
            ReservationState::Settled => return Err(ReleaseError::AlreadySettled(key)),
            ReservationState::Held => {}
        }

        for _ in 0..MAX_CAS_RETRIES {
            let Some(row) = self.snapshot(reservation.product_id) else {
                return Err(ReleaseError::Unknown(key));
            };
            let mut product = row.product.clone();
            product.available_quantity += reservation.quantity;
            product.reserved_quantity = product.reserved_quantity.saturating_sub(reservation.quantity);
            if self.compare_and_swap(reservation.product_id, row.version, product) {
                if let Some(entry) = table.by_key.get_mut(&key) {
                    entry.state = ReservationState::Released;
                    entry.updated_at = Utc::now();
                }
                table
                    .live_by_order
                    .remove(&(reservation.order_id, reservation.product_id));
                return Ok(ReleaseOutcome::Released {
                    quantity: reservation.quantity,
                });
            }
        }
        Err(ReleaseError::Conflict)
    }

    /// Release every hold whose deadline is at or before `now`. Returns the
    /// reservations that were released by this call.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        let due: Vec<Uuid> = {
            let table = self.reservations.lock().unwrap();
            table
                .by_key
                .values()
                .filter(|r| r.state == ReservationState::Held && r.expires_at <= now)
                .map(|r| r.id)
                .collect()
        };

        let mut released = Vec::new();
        for key in due {
            match self.release(key) {
                Ok(ReleaseOutcome::Released { .. }) => {
                    if let Some(reservation) = self.reservation(key) {
                        released.push(reservation);
                    }
                }
                // lost a race with an explicit release or a settlement
                Ok(ReleaseOutcome::AlreadyReleased) | Err(ReleaseError::AlreadySettled(_)) => {}
                Err(err) => {
                    tracing::warn!("could not expire reservation {}: {}", key, err);
                }
            }
        }
        released
    }

    fn return_to_available(&self, product_id: Uuid, quantity: u32) {
        loop {
            let Some(row) = self.snapshot(product_id) else {
                return;
            };
            let mut product = row.product.clone();
            product.available_quantity += quantity;
            product.reserved_quantity = product.reserved_quantity.saturating_sub(quantity);
            if self.compare_and_swap(product_id, row.version, product) {
                return;
            }
        }
    }
}
