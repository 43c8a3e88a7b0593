//! Per-batch export logic run by the worker.
//!
//! [`ExportPipeline::export`] turns one drained batch into envelopes, sends
//! them, and settles the outcome against the overflow store:
//!
//! - **Accepted**: when the batch left headroom (fewer than
//!   `max_batch_size` items), replay up to `replay_limit` stored blobs.
//! - **PartiallyAccepted**: persist exactly the envelopes reported for retry.
//! - **Failed / TransientError**: persist the whole batch, leased until the
//!   retry-after hint if one was given.
//! - **Rejected**: drop the batch and log it.
//!
//! An [`Exit`](ControlSignal::Exit) signal additionally drains every
//! eligible stored blob, since no later export will retry them.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    envelope::Envelope,
    queue::ControlSignal,
    rate_limited_warner::RateLimitedWarner,
    storage::OverflowStore,
    transform::{EnvelopeTransform, ProcessorChain},
    transmitter::{TransmitOutcome, Transmitter, send_guarded},
};

/// Counters describing one [`ExportPipeline::export`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Items converted to envelopes.
    pub transformed: usize,
    /// Items whose transform failed or panicked.
    pub skipped: usize,
    /// Envelopes discarded by a telemetry processor.
    pub filtered: usize,
    /// Envelopes handed to the transmitter for the fresh batch.
    pub transmitted: usize,
    /// Envelopes written to the overflow store.
    pub persisted: usize,
    /// Envelopes lost: rejected by the endpoint or not storable.
    pub dropped: usize,
    /// Stored blobs delivered by replay.
    pub replayed: usize,
}

/// Transform, transmit and overflow handling for one item type.
pub struct ExportPipeline<T> {
    transform: Box<dyn EnvelopeTransform<T>>,
    processors: ProcessorChain,
    transmitter: Arc<dyn Transmitter>,
    storage: Option<Arc<OverflowStore>>,
    max_batch_size: usize,
    replay_limit: usize,
    drop_warner: RateLimitedWarner,
}

impl<T> ExportPipeline<T> {
    pub fn new(
        transform: Box<dyn EnvelopeTransform<T>>,
        transmitter: Arc<dyn Transmitter>,
        storage: Option<Arc<OverflowStore>>,
        max_batch_size: usize,
        replay_limit: usize,
    ) -> Self {
        Self {
            transform,
            processors: ProcessorChain::new(),
            transmitter,
            storage,
            max_batch_size: max_batch_size.max(1),
            replay_limit,
            drop_warner: RateLimitedWarner::default(),
        }
    }

    pub fn with_processors(mut self, processors: ProcessorChain) -> Self {
        self.processors = processors;
        self
    }

    /// Coalesce warnings about lost envelopes over `interval`.
    pub fn with_warn_interval(mut self, interval: Duration) -> Self {
        self.drop_warner = RateLimitedWarner::new(interval);
        self
    }

    /// Export `batch`, then honour `signal`.
    ///
    /// Never panics on behalf of injected components and never returns an
    /// error; failures are contained, logged and reflected in the report.
    /// The caller releases a [`SyncBarrier`](ControlSignal::SyncBarrier)
    /// once this returns.
    pub fn export(&mut self, batch: Vec<T>, signal: Option<&ControlSignal>) -> ExportReport {
        let mut report = ExportReport::default();
        let batch_len = batch.len();
        let envelopes = self.transform_batch(batch, &mut report);
        let before = envelopes.len();
        let envelopes = self.processors.apply(envelopes);
        report.filtered = before - envelopes.len();

        let mut healthy = true;
        if !envelopes.is_empty() {
            report.transmitted = envelopes.len();
            let outcome = send_guarded(self.transmitter.as_ref(), &envelopes);
            healthy = self.settle(outcome, envelopes, &mut report);
        }

        if let Some(store) = &self.storage {
            if signal.is_some_and(ControlSignal::is_exit) {
                report.replayed = store.replay_oldest(usize::MAX, self.transmitter.as_ref());
            } else if healthy && batch_len < self.max_batch_size {
                report.replayed = store.replay_oldest(self.replay_limit, self.transmitter.as_ref());
            }
        }
        if report.replayed > 0 {
            debug!("replayed {} stored blob(s)", report.replayed);
        }
        if signal.is_some_and(ControlSignal::is_exit) {
            self.drop_warner.flush(|count| {
                warn!("dropped {count} undelivered envelopes before shutdown");
            });
        }
        report
    }

    fn transform_batch(&self, batch: Vec<T>, report: &mut ExportReport) -> Vec<Envelope> {
        let mut envelopes = Vec::with_capacity(batch.len());
        for item in batch {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.transform.transform(item)));
            match result {
                Ok(Ok(envelope)) => envelopes.push(envelope),
                Ok(Err(err)) => {
                    debug!("skipping telemetry item: {err}");
                    report.skipped += 1;
                }
                Err(_) => {
                    warn!("telemetry transform panicked; skipping item");
                    report.skipped += 1;
                }
            }
        }
        report.transformed = envelopes.len();
        if report.skipped > 0 {
            warn!("skipped {} telemetry item(s) that failed to transform", report.skipped);
        }
        envelopes
    }

    /// Apply `outcome` to the batch. Returns whether the endpoint accepted it.
    fn settle(
        &self,
        outcome: TransmitOutcome,
        envelopes: Vec<Envelope>,
        report: &mut ExportReport,
    ) -> bool {
        let pending = outcome.not_accepted(envelopes.len());
        if pending > 0 {
            debug!("{pending} of {} envelopes were not accepted", envelopes.len());
        }
        match outcome {
            TransmitOutcome::Accepted => true,
            TransmitOutcome::PartiallyAccepted { mut retry } => {
                retry.sort_unstable();
                retry.dedup();
                let outstanding: Vec<Envelope> = retry
                    .into_iter()
                    .filter_map(|i| envelopes.get(i).cloned())
                    .collect();
                if !outstanding.is_empty() {
                    self.persist(&outstanding, None, report);
                }
                false
            }
            TransmitOutcome::Failed => {
                self.persist(&envelopes, None, report);
                false
            }
            TransmitOutcome::TransientError {
                reason,
                retry_after,
            } => {
                warn!(
                    "transient failure sending {} envelopes: {reason}",
                    envelopes.len()
                );
                self.persist(&envelopes, retry_after, report);
                false
            }
            TransmitOutcome::Rejected { reason } => {
                warn!(
                    "endpoint rejected {} envelopes permanently: {reason}",
                    envelopes.len()
                );
                report.dropped += envelopes.len();
                false
            }
        }
    }

    fn persist(
        &self,
        envelopes: &[Envelope],
        retry_after: Option<Duration>,
        report: &mut ExportReport,
    ) {
        let Some(store) = &self.storage else {
            debug!(
                "local storage disabled; dropping {} undelivered envelopes",
                envelopes.len()
            );
            self.record_lost(envelopes.len(), report);
            return;
        };
        let result = match retry_after {
            Some(lease) => store.persist_leased(envelopes, lease),
            None => store.persist(envelopes),
        };
        match result {
            Ok(blob) => {
                debug!("stored {} envelopes in {}", envelopes.len(), blob.path().display());
                report.persisted += envelopes.len();
            }
            Err(err) => {
                debug!("could not store {} envelopes: {err}", envelopes.len());
                self.record_lost(envelopes.len(), report);
            }
        }
    }

    fn record_lost(&self, count: usize, report: &mut ExportReport) {
        report.dropped += count;
        self.drop_warner.record_drops(count as u64);
        self.drop_warner.warn_if_due(|lost| {
            warn!("dropped {lost} undelivered envelopes that could not be stored");
        });
    }
}

impl<T> std::fmt::Debug for ExportPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("processors", &self.processors)
            .field("storage", &self.storage)
            .field("max_batch_size", &self.max_batch_size)
            .field("replay_limit", &self.replay_limit)
            .field("pending_drop_warnings", &self.drop_warner.pending())
            .finish()
    }
}
