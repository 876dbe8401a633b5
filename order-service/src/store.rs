use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use shared::messages::SettlementEvent;

use crate::models::Order;

/// Settlement event staged for delivery. Stays until a publish succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    pub id: Uuid,
    pub event: SettlementEvent,
    pub published: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OrderTable {
    orders: HashMap<Uuid, Order>,
    outbox: Vec<OutboxRow>,
}

/// Order rows plus their outbox, guarded by one lock so a confirmed order
/// and its settlement event commit together or not at all.
#[derive(Debug, Default)]
pub struct OrderStore {
    table: Mutex<OrderTable>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        self.table.lock().unwrap().orders.insert(order.id, order);
    }

    /// Commit a confirmed order together with its settlement event. Returns
    /// the outbox row id.
    pub fn insert_with_event(&self, order: Order, event: SettlementEvent) -> Uuid {
        let row_id = Uuid::new_v4();
        let mut table = self.table.lock().unwrap();
        table.orders.insert(order.id, order);
        table.outbox.push(OutboxRow {
            id: row_id,
            event,
            published: false,
            attempts: 0,
            created_at: Utc::now(),
        });
        row_id
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.table.lock().unwrap().orders.get(&id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .table
            .lock()
            .unwrap()
            .orders
            .values()
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn mark_settlement_failed(&self, order_id: Uuid) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.orders.get_mut(&order_id) {
            Some(order) => order.mark_settlement_failed(),
            None => false,
        }
    }

    /// Unpublished events, oldest first, capped at `limit`.
    pub fn pending_events(&self, limit: usize) -> Vec<OutboxRow> {
        let table = self.table.lock().unwrap();
        table
            .outbox
            .iter()
            .filter(|row| !row.published)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn mark_published(&self, row_id: Uuid) {
        let mut table = self.table.lock().unwrap();
        if let Some(row) = table.outbox.iter_mut().find(|row| row.id == row_id) {
            row.published = true;
        }
    }

    pub fn record_attempt(&self, row_id: Uuid) {
        let mut table = self.table.lock().unwrap();
        if let Some(row) = table.outbox.iter_mut().find(|row| row.id == row_id) {
            row.attempts += 1;
        }
    }

    pub fn unpublished_count(&self) -> usize {
        self.table
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|row| !row.published)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;

    fn event(order: &Order) -> SettlementEvent {
        SettlementEvent {
            idempotency_key: Uuid::new_v4(),
            order_id: order.id,
            product_id: order.product_id,
            quantity: order.quantity,
        }
    }

    #[test]
    fn confirmed_order_and_outbox_row_commit_together() {
        let store = OrderStore::new();
        let mut order = Order::new(Uuid::new_v4(), 2);
        order.confirm(Uuid::new_v4());
        let row_id = store.insert_with_event(order.clone(), event(&order));

        assert_eq!(store.order(order.id).unwrap().status, OrderStatus::Confirmed);
        let pending = store.pending_events(10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, row_id);
        assert_eq!(pending[0].event.order_id, order.id);
        assert!(!pending[0].published);
    }

    #[test]
    fn published_rows_leave_the_pending_set() {
        let store = OrderStore::new();
        let mut order = Order::new(Uuid::new_v4(), 2);
        order.confirm(Uuid::new_v4());
        let row_id = store.insert_with_event(order.clone(), event(&order));

        store.record_attempt(row_id);
        assert_eq!(store.unpublished_count(), 1);
        store.mark_published(row_id);
        assert_eq!(store.unpublished_count(), 0);
        assert!(store.pending_events(10).is_empty());
    }

    #[test]
    fn pending_events_come_back_oldest_first() {
        let store = OrderStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut order = Order::new(Uuid::new_v4(), 1);
            order.confirm(Uuid::new_v4());
            ids.push(store.insert_with_event(order.clone(), event(&order)));
        }

        let pending = store.pending_events(2);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, ids[0]);
        assert_eq!(pending[1].id, ids[1]);
    }

    #[test]
    fn settlement_failed_flag_applies_once_to_confirmed_orders() {
        let store = OrderStore::new();
        let mut order = Order::new(Uuid::new_v4(), 1);
        order.confirm(Uuid::new_v4());
        store.insert_with_event(order.clone(), event(&order));

        assert!(store.mark_settlement_failed(order.id));
        assert!(!store.mark_settlement_failed(order.id));
        assert_eq!(
            store.order(order.id).unwrap().status,
            OrderStatus::SettlementFailed
        );

        // unknown order id is a no-op
        assert!(!store.mark_settlement_failed(Uuid::new_v4()));
    }
}
