//! In-process broker implementing `QueueClient`.
//!
//! Mirrors the AMQP semantics the worker depends on: durable-flag checks on
//! declare, manual acknowledgment, requeue on nack, redelivery of unsettled
//! messages when the channel closes, and one connection "session" per
//! `connect()`. Failure switches let tests drive the error paths.
//!
//! Like the AMQP client, a refused declaration fails only that call and
//! leaves existing consumers attached, and nothing reconnects after an
//! explicit `close()` until the next `connect()`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{Delivery, DeliveryHandler, DeliveryTag, QueueClient, publish_json, run_handler};
use crate::error::QueueError;
use crate::pipeline::types::SuccessNotice;

/// A message that reached a terminal state.
#[derive(Debug, Clone)]
pub struct Settled {
    pub tag: DeliveryTag,
    pub queue: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    durable: bool,
    ready: VecDeque<Message>,
    consumers: Vec<Arc<dyn DeliveryHandler>>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

#[derive(Default)]
struct State {
    connected: bool,
    closed_by_caller: bool,
    session: u64,
    next_tag: u64,
    refuse_connections: bool,
    fail_publishes: bool,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<DeliveryTag, (String, Message)>,
    acked: Vec<Settled>,
    discarded: Vec<Settled>,
}

impl State {
    /// Hand ready messages to consumers, round robin.
    fn pump(&mut self, queue: &str) {
        let session = self.session;
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.consumers.is_empty() {
                return;
            }
            let Some(message) = q.ready.pop_front() else {
                return;
            };
            let handler = Arc::clone(&q.consumers[q.next_consumer % q.consumers.len()]);
            q.next_consumer = q.next_consumer.wrapping_add(1);

            self.next_tag += 1;
            let tag = DeliveryTag {
                session,
                tag: self.next_tag,
            };
            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
                received_at: Utc::now(),
            };
            self.unacked.insert(tag, (queue.to_string(), message));
            tokio::spawn(run_handler(handler, delivery));
        }
    }

    /// Channel closed: consumers go away, unsettled messages go back.
    fn drop_channel(&mut self) {
        self.connected = false;
        for q in self.queues.values_mut() {
            q.consumers.clear();
        }
        for (_, (queue, mut message)) in self.unacked.drain() {
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        }
    }

    fn open_session(&mut self) -> Result<(), QueueError> {
        if self.refuse_connections {
            return Err(QueueError::Connection {
                reason: "connection refused".into(),
            });
        }
        self.connected = true;
        self.closed_by_caller = false;
        self.session += 1;
        Ok(())
    }

    /// One reconnect attempt when the session is down.
    fn ensure_connected(&mut self) -> Result<(), QueueError> {
        if self.connected {
            return Ok(());
        }
        if self.closed_by_caller {
            return Err(QueueError::NotConnected);
        }
        warn!("Broker connection down, reconnecting");
        self.open_session()
    }

    fn declare(&mut self, queue: &str, durable: bool) -> Result<(), QueueError> {
        match self.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(QueueError::Declaration {
                queue: queue.to_string(),
                reason: format!(
                    "inequivalent arg 'durable': existing {}, requested {}",
                    existing.durable, durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                self.queues
                    .insert(queue.to_string(), MemoryQueue::new(durable));
                Ok(())
            }
        }
    }

    fn claim(&mut self, delivery: &Delivery) -> Result<(String, Message), QueueError> {
        let tag = delivery.tag;
        if !self.connected || tag.session != self.session {
            return Err(QueueError::StaleDelivery { tag: tag.tag });
        }
        self.unacked
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery { tag: tag.tag })
    }
}

/// In-process broker.
pub struct MemoryBroker {
    state: Mutex<State>,
    changed: Notify,
    success_notice_queue: Option<String>,
}

impl MemoryBroker {
    /// Create a disconnected broker with no queues.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Create a broker that emits a `SuccessNotice` to `queue` on every ack.
    pub fn with_success_notices(queue: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(Some(queue.into())))
    }

    fn build(success_notice_queue: Option<String>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            success_notice_queue,
        }
    }

    /// Make connection attempts fail.
    pub async fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().await.refuse_connections = refuse;
    }

    /// Make publishes fail.
    pub async fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().await.fail_publishes = fail;
    }

    /// Simulate the broker dropping the connection.
    pub async fn drop_connection(&self) {
        self.state.lock().await.drop_channel();
        self.changed.notify_waiters();
    }

    /// Messages waiting in `queue` (not delivered to a consumer).
    pub async fn ready(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Waiting messages in `queue`, decoded as JSON. Undecodable ones are skipped.
    pub async fn ready_json<T: DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.ready(queue)
            .await
            .iter()
            .filter_map(|p| serde_json::from_slice(p).ok())
            .collect()
    }

    /// Acknowledged deliveries, oldest first.
    pub async fn acked(&self) -> Vec<Settled> {
        self.state.lock().await.acked.clone()
    }

    /// Deliveries rejected without requeue, oldest first.
    pub async fn discarded(&self) -> Vec<Settled> {
        self.state.lock().await.discarded.clone()
    }

    /// Deliveries handed out and not yet settled.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Whether `queue` has been declared.
    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }

    /// Wait until at least `count` deliveries are acked or discarded.
    /// Returns `false` on timeout.
    pub async fn wait_for_settled(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.lock().await;
                if state.acked.len() + state.discarded.len() >= count {
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let (queue, message) = state.claim(delivery)?;
            match settlement {
                Settlement::Ack => state.acked.push(Settled {
                    tag: delivery.tag,
                    queue,
                    payload: message.payload,
                }),
                Settlement::Requeue => {
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_back(Message {
                            payload: message.payload,
                            redelivered: true,
                        });
                    }
                    state.pump(&queue);
                }
                Settlement::Discard => state.discarded.push(Settled {
                    tag: delivery.tag,
                    queue,
                    payload: message.payload,
                }),
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

#[async_trait]
impl QueueClient for MemoryBroker {
    async fn connect(&self) -> Result<(), QueueError> {
        self.state.lock().await.open_session()?;
        info!("Connected to in-memory broker");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state.declare(queue, durable)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.ensure_connected()?;
            if state.fail_publishes {
                return Err(QueueError::Publish {
                    queue: queue.to_string(),
                    reason: "simulated publish failure".into(),
                });
            }
            state.declare(queue, true)?;
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(Message {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
            }
            state.pump(queue);
        }
        debug!(queue = %queue, bytes = payload.len(), "Published message");
        self.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        state
            .declare(queue, true)
            .map_err(|e| QueueError::Subscribe {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(handler);
        }
        state.pump(queue);
        info!(queue = %queue, "Subscribed to queue");
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, Settlement::Ack).await?;
        if let Some(notice_queue) = &self.success_notice_queue {
            if let Err(e) = publish_json(self, notice_queue, &SuccessNotice::default()).await {
                warn!(queue = %notice_queue, error = %e, "Failed to send success notice");
            }
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.settle(delivery, settlement).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(QueueError::NotConnected);
            }
            state.drop_channel();
            state.closed_by_caller = true;
        }
        self.changed.notify_waiters();
        info!("In-memory broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Records deliveries without settling them.
    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Delivery>>,
        notify: Notify,
    }

    impl Recorder {
        async fn next(&self) -> Delivery {
            loop {
                let notified = self.notify.notified();
                if let Some(d) = self.seen.lock().unwrap().pop() {
                    return d;
                }
                tokio::time::timeout(Duration::from_secs(2), notified)
                    .await
                    .expect("no delivery arrived");
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn on_delivery(&self, delivery: Delivery) {
            self.seen.lock().unwrap().push(delivery);
            self.notify.notify_waiters();
        }
    }

    async fn connected() -> Arc<MemoryBroker> {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_without_consumer_waits_in_queue() {
        let broker = connected().await;
        broker.publish("q", b"one").await.unwrap();
        assert_eq!(broker.ready("q").await, vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn declare_rejects_incompatible_durability() {
        let broker = connected().await;
        broker.declare_queue("q", true).await.unwrap();
        broker.declare_queue("q", true).await.unwrap();
        let err = broker.declare_queue("q", false).await.unwrap_err();
        assert!(matches!(err, QueueError::Declaration { .. }));
    }

    #[tokio::test]
    async fn refused_declaration_keeps_other_consumers() {
        let broker = connected().await;
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("a", recorder.clone()).await.unwrap();

        broker.declare_queue("b", false).await.unwrap();
        let err = broker.declare_queue("b", true).await.unwrap_err();
        assert!(matches!(err, QueueError::Declaration { .. }));

        broker.publish("a", b"after").await.unwrap();
        assert_eq!(recorder.next().await.payload, b"after");
    }

    #[tokio::test]
    async fn close_stops_lazy_reconnects() {
        let broker = connected().await;
        broker.close().await.unwrap();

        let err = broker.publish("q", b"m").await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
        assert!(!broker.is_connected().await);

        broker.connect().await.unwrap();
        broker.publish("q", b"m").await.unwrap();
    }

    #[tokio::test]
    async fn double_ack_is_caught() {
        let broker = connected().await;
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("q", recorder.clone()).await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let delivery = recorder.next().await;
        broker.ack(&delivery).await.unwrap();
        let err = broker.ack(&delivery).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownDelivery { .. }));
        let err = broker.nack(&delivery, false).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownDelivery { .. }));
        assert_eq!(broker.acked().await.len(), 1);
    }

    #[tokio::test]
    async fn double_nack_is_caught() {
        let broker = connected().await;
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("q", recorder.clone()).await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let delivery = recorder.next().await;
        broker.nack(&delivery, false).await.unwrap();
        assert!(broker.nack(&delivery, false).await.is_err());
        assert_eq!(broker.discarded().await.len(), 1);
    }

    #[tokio::test]
    async fn nack_requeue_redelivers() {
        let broker = connected().await;
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("q", recorder.clone()).await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let first = recorder.next().await;
        assert!(!first.redelivered);
        broker.nack(&first, true).await.unwrap();

        let second = recorder.next().await;
        assert!(second.redelivered);
        assert_eq!(second.payload, b"m");
        assert_ne!(first.tag, second.tag);
    }

    #[tokio::test]
    async fn dropped_connection_makes_deliveries_stale() {
        let broker = connected().await;
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("q", recorder.clone()).await.unwrap();
        broker.publish("q", b"m").await.unwrap();
        let delivery = recorder.next().await;

        broker.drop_connection().await;
        assert!(!broker.is_connected().await);
        let err = broker.ack(&delivery).await.unwrap_err();
        assert!(matches!(err, QueueError::StaleDelivery { .. }));

        // The unsettled message is back in the queue for the next consumer.
        assert_eq!(broker.ready("q").await, vec![b"m".to_vec()]);
    }

    #[tokio::test]
    async fn publish_reconnects_once() {
        let broker = connected().await;
        broker.drop_connection().await;
        broker.publish("q", b"m").await.unwrap();
        assert!(broker.is_connected().await);

        broker.drop_connection().await;
        broker.set_refuse_connections(true).await;
        let err = broker.publish("q", b"m").await.unwrap_err();
        assert!(matches!(err, QueueError::Connection { .. }));
    }

    #[tokio::test]
    async fn close_twice_reports_nothing_to_close() {
        let broker = connected().await;
        broker.close().await.unwrap();
        assert!(matches!(
            broker.close().await.unwrap_err(),
            QueueError::NotConnected
        ));
    }

    #[tokio::test]
    async fn ack_emits_success_notice() {
        let broker = MemoryBroker::with_success_notices("notices");
        broker.connect().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        broker.subscribe("q", recorder.clone()).await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let delivery = recorder.next().await;
        broker.ack(&delivery).await.unwrap();
        let notices: Vec<SuccessNotice> = broker.ready_json("notices").await;
        assert_eq!(notices, vec![SuccessNotice::default()]);
    }
}
