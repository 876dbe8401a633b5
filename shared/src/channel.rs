//! In-process message channel with at-least-once delivery.
//!
//! Topics are FIFO queues. A [`Delivery`] must be acknowledged; dropping one
//! without an ack puts the message back on the queue with its attempt count
//! bumped, so consumers that crash mid-message see it again. Publishing can
//! be made to fail via [`InMemoryBroker::inject_publish_failures`] to
//! exercise retry and outbox paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::messages::{dead_letter_topic, DeadLetter};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("channel is closed")]
    Closed,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
struct PendingDelivery {
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Debug)]
struct TopicInner {
    queue: Mutex<VecDeque<PendingDelivery>>,
    notify: Notify,
    closed: watch::Sender<bool>,
}

impl TopicInner {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: watch::channel(false).0,
        }
    }

    fn enqueue(&self, pending: PendingDelivery) {
        self.queue.lock().unwrap().push_back(pending);
        self.notify.notify_one();
    }
}

/// Broker shared by every service in the process. Topics are created on
/// first use, and messages published before anyone subscribes are buffered.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Arc<TopicInner>>>,
    publish_failures: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<TopicInner> {
        let mut topics = self.topics.lock().unwrap();
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TopicInner::new())),
        )
    }

    /// Append a message to `topic`. Fails while injected failures remain or
    /// after the broker has been closed.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Unavailable("injected failure".to_string()));
        }

        let topic = self.topic(topic);
        if *topic.closed.borrow() {
            return Err(ChannelError::Closed);
        }
        topic.enqueue(PendingDelivery { payload, attempt: 1 });
        Ok(())
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let topic = self.topic(topic);
        let closed = topic.closed.subscribe();
        Subscription { topic, closed }
    }

    /// Make the next `count` publishes fail with `Unavailable`. Passing 0
    /// clears any remaining injected failures.
    pub fn inject_publish_failures(&self, count: u32) {
        self.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Stop accepting publishes. Subscribers drain what is already queued,
    /// then their `recv` returns `None`.
    pub fn close(&self) {
        let topics = self.topics.lock().unwrap();
        for topic in topics.values() {
            topic.closed.send_replace(true);
            topic.notify.notify_waiters();
        }
    }

    /// Number of messages currently queued on `topic`.
    pub fn depth(&self, topic: &str) -> usize {
        self.topic(topic).queue.lock().unwrap().len()
    }
}

/// Consumer handle on a single topic. Competing subscriptions on the same
/// topic split the messages between them.
pub struct Subscription {
    topic: Arc<TopicInner>,
    closed: watch::Receiver<bool>,
}

impl Subscription {
    /// Wait for the next message. Returns `None` once the broker is closed
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_recv() {
                return Some(delivery);
            }
            if *self.closed.borrow() {
                return None;
            }
            let notified = self.topic.notify.notified();
            tokio::select! {
                _ = notified => {}
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let mut queue = self.topic.queue.lock().unwrap();
        let pending = queue.pop_front()?;
        if !queue.is_empty() {
            self.topic.notify.notify_one();
        }
        drop(queue);
        Some(Delivery {
            payload: Some(pending.payload),
            attempt: pending.attempt,
            topic: Arc::clone(&self.topic),
        })
    }
}

/// A single message handed to a consumer. Call [`ack`](Self::ack) once the
/// message is fully processed; dropping the delivery un-acked re-queues it
/// for another attempt.
pub struct Delivery {
    payload: Option<Vec<u8>>,
    attempt: u32,
    topic: Arc<TopicInner>,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// How many times this message has been delivered, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Remove the message from the channel for good.
    pub fn ack(mut self) {
        self.payload = None;
    }

    /// Put the message back for redelivery.
    pub fn nack(self) {
        drop(self);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.topic.enqueue(PendingDelivery {
                payload,
                attempt: self.attempt + 1,
            });
        }
    }
}

/// Publisher bound to a broker. Transient publish failures are retried with
/// exponential backoff before the error is surfaced to the caller.
pub struct ChannelClient {
    broker: Arc<InMemoryBroker>,
    max_attempts: u32,
    base_backoff: Duration,
    closed: AtomicBool,
}

impl ChannelClient {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self::with_retry(broker, 5, Duration::from_millis(10))
    }

    pub fn with_retry(broker: Arc<InMemoryBroker>, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            broker,
            max_attempts: max_attempts.max(1),
            base_backoff,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(topic, payload).await
    }

    pub async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut backoff = self.base_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.broker.publish(topic, payload.clone()) {
                Ok(()) => return Ok(()),
                Err(ChannelError::Closed) => return Err(ChannelError::Closed),
                Err(err) if attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    warn!(
                        "publish to {} failed (attempt {}): {}; retrying in {:?}",
                        topic, attempt, err, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Refuse further publishes from this client. In-flight calls finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// How a handler disposed of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; ack the message.
    Ok,
    /// The message can never be processed. It is moved to the topic's
    /// dead-letter queue with the given reason.
    Malformed(String),
    /// Processing failed for a reason that may clear up. The message is
    /// re-queued for another attempt.
    Transient(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

/// Drives a [`MessageHandler`] over a subscription, applying the ack,
/// dead-letter, and redelivery policy uniformly. A malformed message is
/// dead-lettered once per delivery and never kills the loop.
pub struct ConsumerLoop<H> {
    topic: String,
    subscription: Subscription,
    client: Arc<ChannelClient>,
    handler: H,
}

impl<H: MessageHandler> ConsumerLoop<H> {
    pub fn new(
        topic: impl Into<String>,
        subscription: Subscription,
        client: Arc<ChannelClient>,
        handler: H,
    ) -> Self {
        Self {
            topic: topic.into(),
            subscription,
            client,
            handler,
        }
    }

    pub async fn run(mut self) {
        let dlq_topic = dead_letter_topic(&self.topic);
        info!("consuming from {}", self.topic);
        while let Some(delivery) = self.subscription.recv().await {
            match self.handler.handle(&delivery).await {
                HandlerOutcome::Ok => delivery.ack(),
                HandlerOutcome::Malformed(reason) => {
                    let letter = DeadLetter::new(delivery.payload(), &reason, delivery.attempt());
                    match self.client.publish_json(&dlq_topic, &letter).await {
                        Ok(()) => {
                            warn!(
                                "dead-lettered message from {} to {}: {}",
                                self.topic, dlq_topic, reason
                            );
                            delivery.ack();
                        }
                        Err(ChannelError::Closed) => {
                            error!(
                                "dropping malformed message from {} during shutdown: {}",
                                self.topic, reason
                            );
                            delivery.ack();
                        }
                        Err(err) => {
                            error!("could not dead-letter message from {}: {}", self.topic, err);
                            delivery.nack();
                        }
                    }
                }
                HandlerOutcome::Transient(reason) => {
                    warn!(
                        "transient failure on {}: {}; leaving message for redelivery",
                        self.topic, reason
                    );
                    delivery.nack();
                }
            }
        }
        info!("consumer for {} stopped", self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = InMemoryBroker::new();
        broker.publish("t", b"first".to_vec()).unwrap();
        broker.publish("t", b"second".to_vec()).unwrap();

        let mut sub = broker.subscribe("t");
        let first = sub.recv().await.unwrap();
        assert_eq!(first.payload(), b"first");
        assert_eq!(first.attempt(), 1);
        first.ack();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.payload(), b"second");
        second.ack();
        assert_eq!(broker.depth("t"), 0);
    }

    #[tokio::test]
    async fn buffers_messages_published_before_subscribe() {
        let broker = InMemoryBroker::new();
        broker.publish("t", b"early".to_vec()).unwrap();
        let mut sub = broker.subscribe("t");
        assert_eq!(sub.recv().await.unwrap().payload(), b"early");
    }

    #[tokio::test]
    async fn dropping_delivery_requeues_with_bumped_attempt() {
        let broker = InMemoryBroker::new();
        broker.publish("t", b"m".to_vec()).unwrap();

        let mut sub = broker.subscribe("t");
        let first = sub.recv().await.unwrap();
        assert_eq!(first.attempt(), 1);
        drop(first);

        let again = sub.recv().await.unwrap();
        assert_eq!(again.attempt(), 2);
        again.nack();
        let third = sub.recv().await.unwrap();
        assert_eq!(third.attempt(), 3);
        third.ack();
        assert_eq!(broker.depth("t"), 0);
    }

    #[tokio::test]
    async fn close_drains_queue_then_ends_subscription() {
        let broker = InMemoryBroker::new();
        broker.publish("t", b"a".to_vec()).unwrap();
        broker.publish("t", b"b".to_vec()).unwrap();
        broker.close();

        assert!(matches!(
            broker.publish("t", b"c".to_vec()),
            Err(ChannelError::Closed)
        ));

        let mut sub = broker.subscribe("t");
        sub.recv().await.unwrap().ack();
        sub.recv().await.unwrap().ack();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_subscriber() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut sub = broker.subscribe("t");
        let waiter = tokio::spawn(async move { sub.recv().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn client_retries_past_injected_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject_publish_failures(2);

        let client = ChannelClient::with_retry(Arc::clone(&broker), 5, Duration::from_millis(1));
        client
            .publish_json("t", &serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(broker.depth("t"), 1);
    }

    #[tokio::test]
    async fn client_surfaces_error_after_retries_exhausted() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject_publish_failures(10);

        let client = ChannelClient::with_retry(Arc::clone(&broker), 3, Duration::from_millis(1));
        let err = client.publish_bytes("t", b"m".to_vec()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
        assert_eq!(broker.depth("t"), 0);
    }

    #[tokio::test]
    async fn closed_client_refuses_publishes() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = ChannelClient::new(Arc::clone(&broker));
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.publish_bytes("t", b"m".to_vec()).await,
            Err(ChannelError::Closed)
        ));
    }

    struct Rejector;

    #[async_trait]
    impl MessageHandler for Rejector {
        async fn handle(&self, _delivery: &Delivery) -> HandlerOutcome {
            HandlerOutcome::Malformed("always rejected".to_string())
        }
    }

    #[tokio::test]
    async fn malformed_message_is_dead_lettered_once_and_loop_survives() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = Arc::new(ChannelClient::new(Arc::clone(&broker)));
        let mut dlq = broker.subscribe(&dead_letter_topic("t"));

        let consumer = ConsumerLoop::new("t", broker.subscribe("t"), client, Rejector);
        let handle = tokio::spawn(consumer.run());

        broker.publish("t", b"bad one".to_vec()).unwrap();
        let letter: DeadLetter =
            serde_json::from_slice(dlq.recv().await.unwrap().payload()).unwrap();
        assert_eq!(letter.payload, "bad one");
        assert_eq!(letter.reason, "always rejected");
        assert_eq!(letter.attempt, 1);

        // the loop keeps consuming after a dead-letter
        broker.publish("t", b"bad two".to_vec()).unwrap();
        let letter: DeadLetter =
            serde_json::from_slice(dlq.recv().await.unwrap().payload()).unwrap();
        assert_eq!(letter.payload, "bad two");

        // exactly one letter per delivery
        assert!(
            tokio::time::timeout(Duration::from_millis(50), dlq.recv())
                .await
                .is_err()
        );

        broker.close();
        handle.await.unwrap();
    }

    struct FlakyHandler {
        failures_left: AtomicUsize,
        max_attempt_seen: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
            self.max_attempt_seen
                .fetch_max(delivery.attempt() as usize, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                HandlerOutcome::Transient("not yet".to_string())
            } else {
                HandlerOutcome::Ok
            }
        }
    }

    #[tokio::test]
    async fn transient_failures_lead_to_redelivery_until_acked() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = Arc::new(ChannelClient::new(Arc::clone(&broker)));
        let handler = Arc::new(FlakyHandler {
            failures_left: AtomicUsize::new(2),
            max_attempt_seen: AtomicUsize::new(0),
        });

        struct Shared(Arc<FlakyHandler>);
        #[async_trait]
        impl MessageHandler for Shared {
            async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
                self.0.handle(delivery).await
            }
        }

        let consumer = ConsumerLoop::new("t", broker.subscribe("t"), client, Shared(Arc::clone(&handler)));
        let handle = tokio::spawn(consumer.run());

        broker.publish("t", b"m".to_vec()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.max_attempt_seen.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        broker.close();
        handle.await.unwrap();
        assert_eq!(broker.depth("t"), 0);
        assert_eq!(handler.max_attempt_seen.load(Ordering::SeqCst), 3);
    }
}
