use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};

use shared::channel::ChannelClient;
use shared::messages::SETTLEMENT_TOPIC;

use crate::store::OrderStore;

const BATCH_LIMIT: usize = 100;

/// Re-publishes settlement events whose first publish did not go through,
/// giving the channel at-least-once delivery from the order side.
pub struct OutboxProcessor {
    store: Arc<OrderStore>,
    client: Arc<ChannelClient>,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(store: Arc<OrderStore>, client: Arc<ChannelClient>, interval: Duration) -> Self {
        Self {
            store,
            client,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // take one more pass so late confirmations still get published
        self.drain_once().await;
        info!("outbox processor stopped");
    }

    /// Publish every pending event once. Returns how many went through.
    pub async fn drain_once(&self) -> usize {
        let pending = self.store.pending_events(BATCH_LIMIT);
        let mut published = 0;
        for row in pending {
            match self.client.publish_json(SETTLEMENT_TOPIC, &row.event).await {
                Ok(()) => {
                    self.store.mark_published(row.id);
                    published += 1;
                    info!(
                        "published outbox event {} for order {}",
                        row.id, row.event.order_id
                    );
                }
                Err(err) => {
                    self.store.record_attempt(row.id);
                    error!("failed to publish outbox event {}: {}", row.id, err);
                }
            }
        }
        published
    }
}
