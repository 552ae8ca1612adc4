//! Tower middleware layers for the processor pipeline.
//!
//! - [`timeout`]: Per-request processing timeout
//! - [`metrics`]: Processing duration and outcome via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use self::metrics::MetricsLayer;
pub use pipeline::{build_processor_pipeline, ProcessorPipeline};
pub use timeout::TimeoutLayer;
