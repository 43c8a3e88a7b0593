//! Producer-facing handler.
//!
//! [`FemtoTelemetryHandler`] is the only type producers touch. It owns the
//! bounded queue, the worker thread, and the overflow store, and exposes
//! three operations:
//!
//! - [`emit`](FemtoTelemetryHandler::emit) samples, then enqueues without
//!   blocking. A full queue drops the item and records a rate-limited
//!   warning.
//! - [`flush`](FemtoTelemetryHandler::flush) enqueues a sync barrier and
//!   waits, up to the flush timeout, for the worker to export everything
//!   ahead of it.
//! - [`close`](FemtoTelemetryHandler::close) enqueues an exit signal, waits
//!   for the worker to drain, joins it and stops storage maintenance.
//!   Dropping the handler closes it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::warn;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng, rngs::StdRng};

use crate::{
    config::ExportConfig,
    error::{BuildError, HandlerError},
    pipeline::ExportPipeline,
    queue::{BoundedQueue, ControlSignal},
    rate_limited_warner::RateLimitedWarner,
    sampling::SamplingFilter,
    storage::{OverflowStore, StorageStats},
    transform::{EnvelopeTransform, ProcessorChain, TelemetryProcessor},
    transmitter::Transmitter,
    worker::{SharedState, WorkerConfig, WorkerState, spawn_worker},
};

struct WorkerSlot {
    handle: JoinHandle<()>,
    exit_sent: bool,
}

/// Asynchronous, batching exporter for items of type `T`.
pub struct FemtoTelemetryHandler<T: Send + 'static> {
    queue: Arc<BoundedQueue<T>>,
    sampler: SamplingFilter,
    rng: Mutex<Box<dyn RngCore + Send>>,
    storage: Option<Arc<OverflowStore>>,
    worker: Mutex<Option<WorkerSlot>>,
    done_rx: Receiver<()>,
    state: Arc<SharedState>,
    closed: AtomicBool,
    warner: RateLimitedWarner,
    flush_timeout: Duration,
    shutdown_timeout: Duration,
}

impl<T: Send + 'static> FemtoTelemetryHandler<T> {
    /// Start a builder for a handler converting items with `transform`
    /// and delivering them through `transmitter`.
    pub fn builder(
        transform: impl EnvelopeTransform<T> + 'static,
        transmitter: Arc<dyn Transmitter>,
    ) -> TelemetryHandlerBuilder<T> {
        TelemetryHandlerBuilder::new(transform, transmitter)
    }

    /// Queue `item` for export.
    ///
    /// Never blocks. Items removed by sampling count as accepted.
    ///
    /// # Errors
    ///
    /// * [`HandlerError::QueueFull`] - the queue is at capacity; the item was
    ///   dropped
    /// * [`HandlerError::Closed`] - the handler has been closed
    pub fn try_emit(&self, item: T) -> Result<(), HandlerError> {
        if self.closed.load(Ordering::Acquire) {
            self.warner.record_drop();
            self.warner.warn_if_due(|count| {
                warn!("telemetry handler closed; dropped {count} items");
            });
            return Err(HandlerError::Closed);
        }
        if !self.sampler.admits_all() && !self.sampler.allows(&mut **self.rng.lock()) {
            return Ok(());
        }
        self.queue.try_enqueue(item).inspect_err(|_| {
            self.warner.record_drop();
            self.warner.warn_if_due(|count| {
                warn!("telemetry queue full; dropped {count} items");
            });
        })
    }

    /// Queue `item` for export, returning `false` if it was dropped.
    pub fn emit(&self, item: T) -> bool {
        self.try_emit(item).is_ok()
    }

    /// Wait up to the configured flush timeout for every item emitted so
    /// far to be exported. Returns `false` on timeout or after close.
    pub fn flush(&self) -> bool {
        self.flush_with_timeout(self.flush_timeout)
    }

    /// Like [`flush`](Self::flush) with an explicit bound.
    pub fn flush_with_timeout(&self, timeout: Duration) -> bool {
        self.warner.flush(|count| {
            warn!("telemetry handler dropped {count} items in the last interval");
        });
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let (barrier, ack_rx) = ControlSignal::barrier();
        if let Err(err) = self.queue.enqueue_blocking(barrier, timeout) {
            warn!("telemetry flush could not be queued: {err}");
            return false;
        }
        ack_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_ok()
    }

    /// Drain the queue, stop the worker and stop storage maintenance.
    ///
    /// Waits at most the shutdown timeout. Returns `true` once the worker
    /// has stopped; `false` means the drain did not finish in time and may
    /// be retried by calling `close` again. Blobs left in the overflow
    /// store are kept for the next handler opened on the same directory.
    pub fn close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        self.warner.flush(|count| {
            warn!("telemetry handler dropped {count} items in the last interval");
        });
        let mut slot_guard = self.worker.lock();
        let Some(slot) = slot_guard.as_mut() else {
            return self.state.get() == WorkerState::Stopped;
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        if !slot.exit_sent {
            if let Err(err) = self
                .queue
                .enqueue_blocking(ControlSignal::Exit, self.shutdown_timeout)
            {
                warn!("telemetry worker could not be signalled to exit: {err}");
                return false;
            }
            slot.exit_sent = true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.done_rx.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "telemetry worker did not stop within {:?}",
                    self.shutdown_timeout
                );
                return false;
            }
        }
        if let Some(slot) = slot_guard.take()
            && slot.handle.join().is_err()
        {
            warn!("telemetry worker thread panicked");
        }
        if let Some(store) = &self.storage {
            store.close();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn worker_state(&self) -> WorkerState {
        self.state.get()
    }

    /// Items waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Footprint of the overflow store, if local storage is enabled.
    pub fn storage_stats(&self) -> Option<StorageStats> {
        self.storage.as_ref().map(|store| store.stats())
    }
}

impl<T: Send + 'static> Drop for FemtoTelemetryHandler<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Send + 'static> std::fmt::Debug for FemtoTelemetryHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoTelemetryHandler")
            .field("capacity", &self.queue.capacity())
            .field("sampler", &self.sampler)
            .field("storage", &self.storage)
            .field("state", &self.state.get())
            .field("flush_timeout", &self.flush_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Builder for [`FemtoTelemetryHandler`].
pub struct TelemetryHandlerBuilder<T> {
    transform: Box<dyn EnvelopeTransform<T>>,
    transmitter: Arc<dyn Transmitter>,
    config: ExportConfig,
    processors: ProcessorChain,
    rng: Option<Box<dyn RngCore + Send>>,
}

impl<T: Send + 'static> TelemetryHandlerBuilder<T> {
    pub fn new(
        transform: impl EnvelopeTransform<T> + 'static,
        transmitter: Arc<dyn Transmitter>,
    ) -> Self {
        Self {
            transform: Box::new(transform),
            transmitter,
            config: ExportConfig::default(),
            processors: ProcessorChain::new(),
            rng: None,
        }
    }

    /// Replace the default configuration.
    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a processor run on every envelope before transmission.
    pub fn with_processor(mut self, processor: impl TelemetryProcessor + 'static) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Use `rng` for sampling decisions instead of an entropy-seeded one.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// Validate the configuration, open storage and start the worker.
    pub fn build(self) -> Result<FemtoTelemetryHandler<T>, BuildError> {
        let Self {
            transform,
            transmitter,
            config,
            processors,
            rng,
        } = self;
        config.validate()?;
        let sampler = SamplingFilter::new(config.sampling_probability)?;
        let storage = match config.storage() {
            Some(storage_config) => Some(Arc::new(OverflowStore::open(storage_config)?)),
            None => None,
        };

        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let pipeline = ExportPipeline::new(
            transform,
            transmitter,
            storage.clone(),
            config.max_batch_size,
            config.replay_limit,
        )
        .with_processors(processors)
        .with_warn_interval(config.warn_interval);
        let spawned = spawn_worker(
            Arc::clone(&queue),
            pipeline,
            WorkerConfig {
                max_batch_size: config.max_batch_size,
                export_interval: config.export_interval,
            },
        )?;

        Ok(FemtoTelemetryHandler {
            queue,
            sampler,
            rng: Mutex::new(rng.unwrap_or_else(|| Box::new(StdRng::from_entropy()))),
            storage,
            worker: Mutex::new(Some(WorkerSlot {
                handle: spawned.handle,
                exit_sent: false,
            })),
            done_rx: spawned.done_rx,
            state: spawned.state,
            closed: AtomicBool::new(false),
            warner: RateLimitedWarner::new(config.warn_interval),
            flush_timeout: config.flush_timeout,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

impl<T> std::fmt::Debug for TelemetryHandlerBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryHandlerBuilder")
            .field("config", &self.config)
            .field("processors", &self.processors)
            .finish()
    }
}
