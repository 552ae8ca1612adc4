//! Pipeline composition: wraps the processor in all middleware layers.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::processor::{ProcessorService, RequestProcessor};

/// The assembled processor service stack.
///
/// Cheap to clone: every layer holds only `Copy` settings and the processor
/// behind an `Arc`.
pub type ProcessorPipeline = MetricsService<TimeoutService<ProcessorService>>;

/// Build the processor pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, duration and outcome (sees timeouts as faults)
/// 2. `TimeoutLayer` -- bounds the processor call
/// 3. `ProcessorService` -- calls the processor, converting panics into faults
#[must_use]
pub fn build_processor_pipeline(
    processor: Arc<dyn RequestProcessor>,
    processing_timeout: Duration,
) -> ProcessorPipeline {
    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(TimeoutLayer::new(processing_timeout))
        .service(ProcessorService::new(processor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
