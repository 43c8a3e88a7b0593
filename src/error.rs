//! Error types shared across the exporter.
//!
//! Only [`BuildError`] and [`HandlerError`] ever reach producers. Storage,
//! transform, and transmit failures are contained inside the worker and
//! reported through the `log` facade.

use std::{io, time::Duration};

use thiserror::Error;

/// Errors that may occur while building a handler or its components.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid user supplied configuration.
    #[error("invalid exporter configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error whilst preparing storage or spawning threads.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The TLS connector for the HTTP transmitter could not be created.
    #[error("failed to initialise TLS: {0}")]
    Tls(#[from] native_tls::Error),
}

impl From<StorageError> for BuildError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(err) => Self::Io(err),
            other => Self::InvalidConfig(other.to_string()),
        }
    }
}

/// Reasons an item handed to [`FemtoTelemetryHandler::try_emit`] was not queued.
///
/// [`FemtoTelemetryHandler::try_emit`]: crate::FemtoTelemetryHandler::try_emit
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The queue is at capacity; the item was dropped.
    #[error("queue full")]
    QueueFull,
    /// The handler has been closed; the item was dropped.
    #[error("handler closed")]
    Closed,
    /// A blocking enqueue did not find room within the allotted time.
    #[error("timed out after {0:?} waiting for queue capacity")]
    Timeout(Duration),
}

/// Failures raised by the overflow store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("blob encoding error: {0}")]
    Json(#[from] serde_json::Error),
    /// A single batch is larger than the whole store may hold.
    #[error("blob of {size} bytes exceeds storage limit of {limit} bytes")]
    Oversized { size: u64, limit: u64 },
    /// Eviction could not free enough room, typically because non-blob files
    /// occupy the directory.
    #[error("storage full: need {needed} bytes, {available} available")]
    Full { needed: u64, available: u64 },
    #[error("malformed blob name: {0}")]
    BadName(String),
    /// An envelope holds a value JSON cannot round-trip.
    #[error("envelope {index} holds a non-finite number in {field}")]
    NonFinite { index: usize, field: String },
}

/// Failures converting a producer item into an envelope.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    /// The item is structurally valid but cannot be represented on the wire.
    #[error("unsupported telemetry item: {0}")]
    Unsupported(String),
    /// The item carries values the wire format rejects.
    #[error("invalid telemetry item: {0}")]
    Invalid(String),
}

/// Failures raised while talking to the ingestion endpoint.
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode envelopes: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to read response: {0}")]
    Response(#[from] io::Error),
}
