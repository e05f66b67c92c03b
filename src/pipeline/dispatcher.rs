//! Dispatcher — routes deliveries through validation and policy, publishes
//! outcomes, and settles the source message.
//!
//! Per delivery:
//! 1. `validator::parse()` — unparsable → nack without requeue
//! 2. `validator::validate()` — missing fields → nack without requeue
//! 3. `policy::decide_guarded()` — never fails, errors become `ERROR` outcomes
//! 4. publish the outcome to the results queue (failure is logged only)
//! 5. ack
//!
//! There is no requeue path. Requeueing a message that already failed
//! structurally would loop forever.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryHandler, QueueClient, publish_json};
use crate::error::MessageError;
use crate::pipeline::policy::{ReservationPolicy, decide_guarded};
use crate::pipeline::types::ReservationStatus;
use crate::pipeline::validator;

/// Why a delivery was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Body was not a UTF-8 JSON object.
    Unparsable,
    /// Required fields were absent.
    MissingFields(Vec<&'static str>),
}

/// Terminal state of a handled delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A decision was made.
    Decided {
        status: ReservationStatus,
        /// Whether the outcome reached the results queue.
        result_published: bool,
        /// Whether the broker accepted the ack. When false the broker keeps
        /// the message and redelivers it.
        acked: bool,
    },
    /// The message failed a gate and was nacked without requeue.
    Rejected {
        reason: RejectReason,
        /// Whether the broker accepted the nack.
        nacked: bool,
    },
}

/// Routes deliveries from the input queues to the results queue.
pub struct Dispatcher {
    client: Arc<dyn QueueClient>,
    policy: Arc<dyn ReservationPolicy>,
    results_queue: String,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(
        client: Arc<dyn QueueClient>,
        policy: Arc<dyn ReservationPolicy>,
        results_queue: impl Into<String>,
    ) -> Self {
        Self {
            client,
            policy,
            results_queue: results_queue.into(),
        }
    }

    /// Queue outcomes are published to.
    pub fn results_queue(&self) -> &str {
        &self.results_queue
    }

    /// Declare the results queue and subscribe to every input queue.
    ///
    /// A queue that cannot be subscribed is logged and skipped. Returns the
    /// number of live subscriptions.
    pub async fn start(self: &Arc<Self>, queues: &[String]) -> usize {
        if let Err(e) = self.client.declare_queue(&self.results_queue, true).await {
            error!(queue = %self.results_queue, error = %e, "Failed to declare results queue");
        }

        let mut subscribed = 0;
        for queue in queues {
            let handler: Arc<dyn DeliveryHandler> = Arc::clone(self) as Arc<dyn DeliveryHandler>;
            match self.client.subscribe(queue, handler).await {
                Ok(()) => subscribed += 1,
                Err(e) => error!(queue = %queue, error = %e, "Error subscribing to queue"),
            }
        }

        info!(
            subscribed,
            total = queues.len(),
            results_queue = %self.results_queue,
            policy = self.policy.name(),
            "Dispatcher started"
        );
        subscribed
    }

    /// Handle one delivery to completion and settle it once. The returned
    /// disposition says whether the broker accepted the settlement.
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        debug!(
            queue = %delivery.queue,
            delivery_tag = delivery.tag.tag,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        let request = match validator::validate_payload(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                let reason = match e {
                    MessageError::Parse(ref detail) => {
                        warn!(
                            queue = %delivery.queue,
                            delivery_tag = delivery.tag.tag,
                            error = %detail,
                            "Discarding unparsable message"
                        );
                        RejectReason::Unparsable
                    }
                    MessageError::MissingFields(ref missing) => {
                        warn!(
                            queue = %delivery.queue,
                            delivery_tag = delivery.tag.tag,
                            missing = %missing.join(","),
                            payload = %String::from_utf8_lossy(&delivery.payload),
                            "Received invalid message"
                        );
                        RejectReason::MissingFields(missing.clone())
                    }
                };
                let nacked = self.discard(&delivery).await;
                return Disposition::Rejected { reason, nacked };
            }
        };

        info!(
            queue = %delivery.queue,
            reservation_id = %request.reservation_id,
            "Processing reservation"
        );

        let outcome = decide_guarded(self.policy.as_ref(), &request);

        // The source is acked even when this fails; the decision is not rerun.
        let result_published =
            match publish_json(self.client.as_ref(), &self.results_queue, &outcome).await {
                Ok(()) => {
                    info!(
                        reservation_id = %outcome.reservation_id,
                        status = %outcome.status,
                        "Result sent to queue"
                    );
                    true
                }
                Err(e) => {
                    error!(
                        reservation_id = %outcome.reservation_id,
                        queue = %self.results_queue,
                        error = %e,
                        "Error sending result to queue"
                    );
                    false
                }
            };

        let acked = match self.client.ack(&delivery).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    reservation_id = %request.reservation_id,
                    delivery_tag = delivery.tag.tag,
                    error = %e,
                    "Failed to ack delivery"
                );
                false
            }
        };

        Disposition::Decided {
            status: outcome.status,
            result_published,
            acked,
        }
    }

    async fn discard(&self, delivery: &Delivery) -> bool {
        match self.client.nack(delivery, false).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.tag.tag,
                    error = %e,
                    "Failed to nack delivery"
                );
                false
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for Dispatcher {
    async fn on_delivery(&self, delivery: Delivery) {
        self.handle(delivery).await;
    }
}
