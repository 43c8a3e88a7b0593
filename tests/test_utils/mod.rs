//! Shared helpers for integration tests.
#![allow(dead_code)]

pub mod mock_server;
pub mod transmitters;

use std::{sync::Arc, time::Duration};

use femtoexport::{
    CustomEvent, EventTransform, ExportConfig, FemtoTelemetryHandler, StorageConfig,
    TransformContext, Transmitter,
};
use rstest::fixture;
use tempfile::TempDir;

pub use transmitters::{RecordingTransmitter, SentBatch};

/// Fresh directory for an overflow store.
#[fixture]
pub fn store_dir() -> TempDir {
    tempfile::tempdir().expect("create store dir")
}

/// Configuration with quiet timers, rooted at `dir` when storage is wanted.
pub fn test_config(dir: Option<&TempDir>) -> ExportConfig {
    let mut config = ExportConfig {
        export_interval: Duration::from_secs(30),
        flush_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        enable_local_storage: dir.is_some(),
        ..ExportConfig::default()
    };
    if let Some(dir) = dir {
        config.storage = StorageConfig {
            maintenance_period: Duration::from_secs(3600),
            ..StorageConfig::at(dir.path())
        };
    }
    config
}

/// Handler exporting [`CustomEvent`]s through `transmitter`.
pub fn event_handler(
    transmitter: Arc<dyn Transmitter>,
    config: ExportConfig,
) -> FemtoTelemetryHandler<CustomEvent> {
    FemtoTelemetryHandler::builder(EventTransform::new(TransformContext::default()), transmitter)
        .with_config(config)
        .build()
        .expect("build handler")
}

pub fn event(name: &str) -> CustomEvent {
    CustomEvent::new(name)
}
