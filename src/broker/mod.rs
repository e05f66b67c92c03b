//! Broker abstraction — queue declaration, publish, consume, settlement.
//!
//! `QueueClient` is the seam the dispatcher is built against:
//! - `amqp::AmqpClient` — production client over one AMQP connection/channel
//! - `memory::MemoryBroker` — in-process broker for tests and dry runs
//!
//! Every broker failure comes back as a `QueueError`. Nothing a client does
//! may panic inside a consumer task: a dead consumer task silently stops
//! message flow for its queue.

pub mod amqp;
pub mod memory;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::QueueError;

pub use amqp::AmqpClient;
pub use memory::MemoryBroker;

// ── Delivery ────────────────────────────────────────────────────────

/// Broker-assigned handle for one delivery.
///
/// `session` identifies the connection that issued `tag`; tags are only
/// meaningful on the channel that delivered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub session: u64,
    pub tag: u64,
}

/// A message handed to a consumer. Must be settled exactly once.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Broker flagged this as a redelivery.
    pub redelivered: bool,
    pub received_at: DateTime<Utc>,
}

/// Receives deliveries from a subscription.
///
/// Implementations must settle every delivery they are given.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery);
}

// ── Client trait ────────────────────────────────────────────────────

/// Serialized access to a single broker connection and channel.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Open the connection and channel. Check `is_connected()` first;
    /// calling this on a live client is not guaranteed to be a no-op.
    async fn connect(&self) -> Result<(), QueueError>;

    /// Whether both connection and channel are usable.
    async fn is_connected(&self) -> bool;

    /// Declare a queue. Idempotent for matching parameters.
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), QueueError>;

    /// Send a persistent message to `queue` through the default exchange.
    ///
    /// Returns once the frame is written. There is no publisher confirm, so
    /// a broker crash before the message reaches disk can lose it.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Start consuming `queue` in manual-ack mode. Deliveries are handed to
    /// `handler` until the channel closes.
    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), QueueError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Reject a delivery, optionally returning it to the queue.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Close channel, then connection. `NotConnected` when nothing is open.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T>(
    client: &dyn QueueClient,
    queue: &str,
    value: &T,
) -> Result<(), QueueError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    client.publish(queue, &payload).await
}

/// Close `client`, logging the outcome. Returns whether a connection was
/// actually closed.
pub async fn close_logged(client: &dyn QueueClient) -> bool {
    match client.close().await {
        Ok(()) => true,
        Err(QueueError::NotConnected) => {
            info!("Broker connection already closed");
            false
        }
        Err(e) => {
            warn!(error = %e, "Error closing broker connection");
            false
        }
    }
}

/// Run a handler, logging instead of propagating a panic.
///
/// A delivery whose handler panicked stays unsettled and is redelivered
/// once the channel closes.
pub(crate) async fn run_handler(handler: Arc<dyn DeliveryHandler>, delivery: Delivery) {
    let queue = delivery.queue.clone();
    let tag = delivery.tag.tag;
    if AssertUnwindSafe(handler.on_delivery(delivery))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(queue = %queue, delivery_tag = tag, "Delivery handler panicked");
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

/// Tracks deliveries that are open (handed out, not yet settled).
///
/// Settling through the ledger first means a second ack/nack of the same
/// delivery is rejected locally instead of reaching the broker, where an
/// unknown tag closes the channel.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    open: Mutex<HashSet<DeliveryTag>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery as open.
    pub fn open(&self, tag: DeliveryTag) {
        self.lock().insert(tag);
    }

    /// Claim a delivery for settlement. Returns `false` if it was never
    /// opened or is already settled.
    pub fn settle(&self, tag: DeliveryTag) -> bool {
        self.lock().remove(&tag)
    }

    /// Drop every open delivery of a session (its channel is gone).
    pub fn forget_session(&self, session: u64) -> usize {
        let mut open = self.lock();
        let before = open.len();
        open.retain(|t| t.session != session);
        before - open.len()
    }

    /// Number of open deliveries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<DeliveryTag>> {
        // The set stays consistent even if a holder panicked.
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
