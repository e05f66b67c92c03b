//! AMQP 0-9-1 client over a single connection and channel (lapin).
//!
//! All channel operations (qos, declare, publish, consume, ack, nack, close)
//! run while holding the session lock, so concurrent handlers never
//! interleave frames on the shared channel. Decoding and policy work happen
//! outside the lock.
//!
//! Reconnection is lazy and single-shot: `declare_queue`, `publish` and
//! `subscribe` reopen a dead session once and give up with
//! `QueueError::Connection` if that fails. After `close()` nothing reconnects
//! until the next explicit `connect()`.
//!
//! Queue declarations run on a throwaway channel. A declaration the broker
//! refuses (406 PRECONDITION_FAILED) closes only that channel, so consumers on
//! the shared channel keep running.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Delivery, DeliveryHandler, DeliveryLedger, DeliveryTag, QueueClient, publish_json, run_handler,
};
use crate::error::QueueError;
use crate::pipeline::types::SuccessNotice;

/// Persistent delivery mode (survives a broker restart once on disk).
const PERSISTENT: u8 = 2;

/// Reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Client tuning.
#[derive(Debug, Clone, Default)]
pub struct AmqpOptions {
    /// `basic.qos` prefetch count (0 = unlimited).
    pub prefetch: u16,
    /// Side-channel queue receiving a `SuccessNotice` after every ack.
    pub success_notice_queue: Option<String>,
}

/// One open connection and its channel.
struct Session {
    id: u64,
    connection: Connection,
    channel: Channel,
    /// Queues declared on this session by `publish`.
    declared: HashSet<String>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Production `QueueClient`.
pub struct AmqpClient {
    uri: SecretString,
    options: AmqpOptions,
    session: Mutex<Option<Session>>,
    sessions: AtomicU64,
    ledger: Arc<DeliveryLedger>,
    /// Set by `close()`, cleared by `connect()`.
    closed: Arc<AtomicBool>,
}

impl AmqpClient {
    /// Create a disconnected client for `uri`.
    pub fn new(uri: SecretString, options: AmqpOptions) -> Self {
        Self {
            uri,
            options,
            session: Mutex::new(None),
            sessions: AtomicU64::new(0),
            ledger: Arc::new(DeliveryLedger::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliveries handed to handlers and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    async fn open_session(&self) -> Result<Session, QueueError> {
        let connection = Connection::connect(self.uri.expose_secret(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection {
                reason: e.to_string(),
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection {
                reason: format!("channel open failed: {e}"),
            })?;

        if self.options.prefetch > 0 {
            channel
                .basic_qos(self.options.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| QueueError::Connection {
                    reason: format!("basic.qos failed: {e}"),
                })?;
        }

        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session = id, prefetch = self.options.prefetch, "Connected to broker");

        Ok(Session {
            id,
            connection,
            channel,
            declared: HashSet::new(),
        })
    }

    /// Return a live session, reopening a dead one once.
    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<Session>>,
    ) -> Result<&'a mut Session, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::NotConnected);
        }
        let alive = guard.as_ref().is_some_and(Session::is_alive);
        if !alive {
            if let Some(dead) = guard.take() {
                let dropped = self.ledger.forget_session(dead.id);
                warn!(
                    session = dead.id,
                    unsettled = dropped,
                    "Broker session lost, reconnecting"
                );
            }
            match self.open_session().await {
                Ok(session) => **guard = Some(session),
                Err(e) => {
                    error!(error = %e, "Reconnect failed");
                    return Err(e);
                }
            }
        }
        guard.as_mut().ok_or(QueueError::NotConnected)
    }

    async fn declare_on(session: &Session, queue: &str, durable: bool) -> Result<(), QueueError> {
        let channel = session
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Declaration {
                queue: queue.to_string(),
                reason: format!("channel open failed: {e}"),
            })?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| QueueError::Declaration {
                queue: queue.to_string(),
                reason: e.to_string(),
            });

        // A refused declaration has already closed the channel.
        if channel.status().connected() {
            if let Err(e) = channel.close(REPLY_SUCCESS, "declaration done").await {
                debug!(queue = %queue, error = %e, "Failed to close declaration channel");
            }
        }
        declared
    }

    /// Check a delivery against the live session and claim it in the ledger.
    fn claim<'a>(
        &self,
        guard: &'a MutexGuard<'_, Option<Session>>,
        delivery: &Delivery,
    ) -> Result<&'a Session, QueueError> {
        let session = guard.as_ref().ok_or(QueueError::NotConnected)?;
        if session.id != delivery.tag.session {
            return Err(QueueError::StaleDelivery {
                tag: delivery.tag.tag,
            });
        }
        if !self.ledger.settle(delivery.tag) {
            return Err(QueueError::UnknownDelivery {
                tag: delivery.tag.tag,
            });
        }
        Ok(session)
    }

    async fn send_success_notice(&self) {
        let Some(queue) = &self.options.success_notice_queue else {
            return;
        };
        if let Err(e) = publish_json(self, queue, &SuccessNotice::default()).await {
            warn!(queue = %queue, error = %e, "Failed to send success notice");
        }
    }
}

#[async_trait]
impl QueueClient for AmqpClient {
    async fn connect(&self) -> Result<(), QueueError> {
        let mut guard = self.session.lock().await;
        self.closed.store(false, Ordering::SeqCst);
        if let Some(old) = guard.take() {
            warn!(session = old.id, "connect() called on an open client, replacing session");
            self.ledger.forget_session(old.id);
        }
        match self.open_session().await {
            Ok(session) => {
                *guard = Some(session);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Error connecting to broker");
                Err(e)
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(Session::is_alive)
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        let mut guard = self.session.lock().await;
        let session = self.ensure_connected(&mut guard).await?;
        Self::declare_on(session, queue, durable).await.inspect_err(|e| {
            error!(queue = %queue, error = %e, "Queue declaration failed");
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut guard = self.session.lock().await;
        let session = self.ensure_connected(&mut guard).await?;

        if !session.declared.contains(queue) {
            Self::declare_on(session, queue, true).await?;
            session.declared.insert(queue.to_string());
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        // The returned confirm is dropped: the channel is not in confirm mode.
        session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| QueueError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        debug!(queue = %queue, bytes = payload.len(), "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), QueueError> {
        let (consumer, session_id) = {
            let mut guard = self.session.lock().await;
            let session = self.ensure_connected(&mut guard).await?;
            Self::declare_on(session, queue, true).await?;

            let consumer_tag = format!("reservation-worker-{queue}-{}", Uuid::new_v4());
            let consumer = session
                .channel
                .basic_consume(
                    queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_ack: false,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| QueueError::Subscribe {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })?;
            (consumer, session.id)
        };

        info!(queue = %queue, session = session_id, "Subscribed to queue");
        tokio::spawn(consume(
            consumer,
            queue.to_string(),
            session_id,
            Arc::clone(&self.ledger),
            Arc::clone(&self.closed),
            handler,
        ));
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let guard = self.session.lock().await;
            let session = self.claim(&guard, delivery)?;
            session
                .channel
                .basic_ack(delivery.tag.tag, BasicAckOptions::default())
                .await
                .map_err(|e| QueueError::Settle {
                    tag: delivery.tag.tag,
                    reason: e.to_string(),
                })?;
        }
        self.send_success_notice().await;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        let guard = self.session.lock().await;
        let session = self.claim(&guard, delivery)?;
        session
            .channel
            .basic_nack(
                delivery.tag.tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| QueueError::Settle {
                tag: delivery.tag.tag,
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut guard = self.session.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        let Some(session) = guard.take() else {
            warn!("No active connection to close");
            return Err(QueueError::NotConnected);
        };

        info!(session = session.id, "Closing broker connection");
        let unsettled = self.ledger.forget_session(session.id);
        if unsettled > 0 {
            warn!(unsettled, "Closing with unsettled deliveries; the broker will redeliver them");
        }

        // Channel first so consumers stop before the connection goes.
        if session.channel.status().connected() {
            session
                .channel
                .close(REPLY_SUCCESS, "worker shutdown")
                .await
                .map_err(|e| QueueError::Close {
                    reason: format!("channel: {e}"),
                })?;
        }
        if session.connection.status().connected() {
            session
                .connection
                .close(REPLY_SUCCESS, "worker shutdown")
                .await
                .map_err(|e| QueueError::Close {
                    reason: format!("connection: {e}"),
                })?;
        }

        info!("Broker connection closed");
        Ok(())
    }
}

/// Drain a consumer until its channel closes, one task per delivery.
async fn consume(
    mut consumer: Consumer,
    queue: String,
    session: u64,
    ledger: Arc<DeliveryLedger>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn DeliveryHandler>,
) {
    while let Some(item) = consumer.next().await {
        match item {
            Ok(message) => {
                let tag = DeliveryTag {
                    session,
                    tag: message.delivery_tag,
                };
                ledger.open(tag);
                let delivery = Delivery {
                    tag,
                    queue: queue.clone(),
                    payload: message.data,
                    redelivered: message.redelivered,
                    received_at: Utc::now(),
                };
                tokio::spawn(run_handler(Arc::clone(&handler), delivery));
            }
            Err(e) => {
                error!(queue = %queue, session, error = %e, "Consumer stream failed");
                break;
            }
        }
    }
    if closed.load(Ordering::SeqCst) {
        info!(queue = %queue, session, "Consumer stopped");
    } else {
        error!(
            queue = %queue,
            session,
            "Consumer stopped while the client is open; queue is no longer consumed"
        );
    }
}
