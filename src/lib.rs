//! Batching telemetry exporter.
//!
//! Producers hand items to a [`FemtoTelemetryHandler`], which samples them,
//! queues them without blocking, and lets a single worker thread export them
//! in batches through a [`Transmitter`]. Batches the endpoint does not accept
//! are kept in an [`OverflowStore`] on disk and replayed once delivery
//! succeeds again, including after a restart.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use femtoexport::{
//!     ExportConfig, FemtoTelemetryHandler, HttpTransmitter, HttpTransmitterConfig, LogRecord,
//!     LogTransform, Severity, TransformContext,
//! };
//!
//! let transmitter = HttpTransmitter::new(HttpTransmitterConfig::new(
//!     "https://ingest.example.com/v2/track",
//! ))?;
//! let handler = FemtoTelemetryHandler::builder(
//!     LogTransform::new(TransformContext::with_instrumentation_key("key")),
//!     Arc::new(transmitter),
//! )
//! .with_config(ExportConfig::default())
//! .build()?;
//!
//! handler.emit(LogRecord::new("app", Severity::Info, "started"));
//! handler.flush();
//! handler.close();
//! # Ok::<(), femtoexport::BuildError>(())
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod items;
pub mod level;
pub mod pipeline;
pub mod queue;
pub mod rate_limited_warner;
pub mod sampling;
pub mod storage;
pub mod transform;
pub mod transmitter;
pub mod worker;

pub use config::{ExportConfig, ExportConfigBuilder, StorageConfig};
pub use envelope::{Envelope, Payload};
pub use error::{BuildError, HandlerError, StorageError, TransformError, TransmitError};
pub use handler::{FemtoTelemetryHandler, TelemetryHandlerBuilder};
pub use items::{CustomEvent, ExceptionInfo, LogRecord, MetricPoint, StackFrame, TraceContext};
pub use level::Severity;
pub use pipeline::{ExportPipeline, ExportReport};
pub use queue::{BoundedQueue, ControlSignal};
pub use sampling::SamplingFilter;
pub use storage::{MaintenanceReport, OverflowStore, StorageStats, StoredBlob};
pub use transform::{
    EnvelopeTransform, EventTransform, LogTransform, MetricTransform, ProcessorChain,
    TelemetryProcessor, TransformContext,
};
pub use transmitter::{
    AuthConfig, HttpTransmitter, HttpTransmitterConfig, TransmitOutcome, Transmitter,
};
pub use worker::WorkerState;

/// `logtest::Logger::start` installs a process-global logger and panics if
/// called twice, so tests share a single installation.
#[cfg(test)]
pub(crate) fn test_logger() -> logtest::Logger {
    static START: std::sync::Once = std::sync::Once::new();
    START.call_once(|| {
        logtest::Logger::start();
    });
    logtest::Logger
}
