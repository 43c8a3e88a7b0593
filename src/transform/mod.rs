//! Conversion of producer items into wire envelopes.
//!
//! The exporter is generic over the item type; everything that differs
//! between a log exporter, an event exporter, and a metric exporter lives in
//! an [`EnvelopeTransform`]. Closures of the right shape implement the trait
//! directly, and [`LogTransform`], [`EventTransform`], and
//! [`MetricTransform`] cover the built-in [`items`](crate::items).
//!
//! After a transform succeeds, the envelope runs through the configured
//! [`TelemetryProcessor`] chain, which may rewrite or discard it.

mod builtin;
mod processor;

pub use builtin::{EventTransform, LogTransform, MetricTransform, TransformContext};
pub use processor::{ProcessorChain, TelemetryProcessor};

use crate::{envelope::Envelope, error::TransformError};

/// Maps one producer item to one envelope.
///
/// Implementations run on the worker thread. A returned error skips only
/// the offending item; the rest of the batch continues.
pub trait EnvelopeTransform<T>: Send {
    fn transform(&self, item: T) -> Result<Envelope, TransformError>;
}

impl<T, F> EnvelopeTransform<T> for F
where
    F: Fn(T) -> Result<Envelope, TransformError> + Send,
{
    fn transform(&self, item: T) -> Result<Envelope, TransformError> {
        self(item)
    }
}
