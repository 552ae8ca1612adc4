//! Per-message processing path: decode, process, settle.
//!
//! Every failure on this path is caught and logged here; nothing propagates
//! back into the broker's receive loop.

use std::sync::Arc;

use async_trait::async_trait;
use dronedelivery_core::{decode, DeadLetterReason, Disposition};
use tower::ServiceExt;
use tracing::{error, info, warn};

use super::drain::InFlightTracker;
use crate::broker::{BrokerErrorEvent, ErrorHandler, MessageEvent, MessageHandler};
use crate::processor::{ProcessError, ProcessRequest, ProcessorPipeline};

/// Counter of settled messages, labelled by disposition.
pub const MESSAGES_TOTAL: &str = "workflow_messages_total";

/// Counter of errors received on the broker error channel, labelled by source.
pub const BROKER_ERRORS_TOTAL: &str = "workflow_broker_errors_total";

/// Message handler registered on the queue subscription.
pub struct DeliveryDispatcher {
    pipeline: ProcessorPipeline,
    in_flight: InFlightTracker,
}

impl DeliveryDispatcher {
    #[must_use]
    pub fn new(pipeline: ProcessorPipeline, in_flight: InFlightTracker) -> Self {
        Self {
            pipeline,
            in_flight,
        }
    }

    /// Runs one delivery attempt to its disposition.
    pub async fn dispatch(&self, event: &MessageEvent) -> Disposition {
        let _guard = self.in_flight.guard();
        let message = &event.message;
        let message_id = message.message_id.as_str();
        info!(
            message_id,
            delivery_count = message.delivery_count,
            "processing message"
        );

        let (reason, description) = match decode(&message.body) {
            Err(e) => {
                error!(
                    message_id,
                    stage = "decode",
                    kind = e.kind(),
                    error = %e,
                    "cannot parse payload from message"
                );
                (DeadLetterReason::UnparseablePayload, e.to_string())
            }
            Ok(request) => {
                let delivery_id = request.delivery_id.clone();
                let req = ProcessRequest {
                    message_id: message.message_id.clone(),
                    request: Arc::new(request),
                    properties: Arc::new(message.properties.clone()),
                };
                match self.pipeline.clone().oneshot(req).await {
                    Ok(()) => return self.record(complete(event).await),
                    Err(ProcessError::Rejected { reason }) => {
                        warn!(
                            message_id,
                            delivery_id = %delivery_id,
                            stage = "process",
                            reason = %reason,
                            "delivery request rejected"
                        );
                        (DeadLetterReason::ProcessingRejected, reason)
                    }
                    Err(e) => {
                        error!(
                            message_id,
                            delivery_id = %delivery_id,
                            stage = "process",
                            error = %e,
                            "error processing message"
                        );
                        (DeadLetterReason::ProcessingFailed, e.to_string())
                    }
                }
            }
        };

        self.record(dead_letter(event, reason, &description).await)
    }

    fn record(&self, disposition: Disposition) -> Disposition {
        metrics::counter!(MESSAGES_TOTAL, "disposition" => disposition.as_str()).increment(1);
        disposition
    }

    #[must_use]
    pub fn in_flight(&self) -> &InFlightTracker {
        &self.in_flight
    }
}

async fn complete(event: &MessageEvent) -> Disposition {
    let message_id = event.message.message_id.as_str();
    match event.complete().await {
        Ok(()) => {
            info!(message_id, disposition = "completed", "message completed");
            Disposition::Completed
        }
        Err(e) => {
            error!(
                message_id,
                stage = "complete",
                error = %e,
                "error completing message, leaving it for redelivery"
            );
            Disposition::Unresolved
        }
    }
}

async fn dead_letter(
    event: &MessageEvent,
    reason: DeadLetterReason,
    description: &str,
) -> Disposition {
    let message_id = event.message.message_id.as_str();
    match event.dead_letter(reason.as_str(), description).await {
        Ok(()) => {
            warn!(
                message_id,
                disposition = "dead_lettered",
                reason = reason.as_str(),
                "message moved to dead letter queue"
            );
            Disposition::DeadLettered(reason)
        }
        Err(e) => {
            error!(
                message_id,
                stage = "dead_letter",
                error = %e,
                "error moving message to dead letter queue, leaving it for redelivery"
            );
            Disposition::Unresolved
        }
    }
}

#[async_trait]
impl MessageHandler for DeliveryDispatcher {
    async fn on_message(&self, event: MessageEvent) {
        self.dispatch(&event).await;
    }
}

/// Error handler registered on the queue subscription. Logs and carries on;
/// the broker client owns reconnection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerErrorLogger;

#[async_trait]
impl ErrorHandler for BrokerErrorLogger {
    async fn on_error(&self, event: BrokerErrorEvent) {
        metrics::counter!(BROKER_ERRORS_TOTAL, "source" => event.source.as_str()).increment(1);
        error!(
            stage = event.source.as_str(),
            namespace = %event.fully_qualified_namespace,
            entity_path = %event.entity_path,
            error = %event.error,
            "error reported by message broker"
        );
    }
}
