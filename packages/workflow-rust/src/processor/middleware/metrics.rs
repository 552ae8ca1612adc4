//! Metrics middleware for the processor pipeline.
//!
//! Wraps each processor call in a `tracing` span carrying the message id,
//! delivery id and correlation id, records duration and outcome on it, and
//! feeds the duration into a `metrics` histogram.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::processor::{ProcessError, ProcessRequest};

/// Histogram of processor call durations in seconds, labelled by outcome.
pub const PROCESS_DURATION_SECONDS: &str = "workflow_process_duration_seconds";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments processor calls with timing and outcome.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records processing duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<ProcessRequest> for MetricsService<S>
where
    S: Service<ProcessRequest, Response = (), Error = ProcessError> + Send,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = ProcessError;
    type Future = Pin<Box<dyn Future<Output = Result<(), ProcessError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ProcessRequest) -> Self::Future {
        let span = info_span!(
            "process",
            message_id = %req.message_id,
            delivery_id = %req.request.delivery_id,
            correlation_id = req.properties.correlation_id().unwrap_or(""),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(()) => "ok",
                    Err(ProcessError::Rejected { .. }) => "rejected",
                    Err(ProcessError::Fault(_)) => "fault",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::histogram!(PROCESS_DURATION_SECONDS, "outcome" => outcome)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(duration_ms, outcome, "processor call finished");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
