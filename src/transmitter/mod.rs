//! Delivery of envelope batches to the ingestion endpoint.
//!
//! The pipeline only relies on the [`Transmitter`] contract: send a slice of
//! envelopes, report what was not accepted. Delivery is at-least-once; an
//! envelope reported as not accepted may have reached the remote side (for
//! example when a response is lost after the server committed the batch)
//! and will be sent again.
//!
//! [`HttpTransmitter`] is the bundled implementation, posting JSON over
//! HTTP with `ureq`.

mod http;

pub use http::{
    AuthConfig, HttpTransmitter, HttpTransmitterConfig, ResponseClass, classify_status,
};

use std::{
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use crate::envelope::Envelope;

/// What happened to one transmit call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// Every envelope was durably accepted.
    Accepted,
    /// Some envelopes should be retried. `retry` holds their indices into
    /// the slice passed to [`Transmitter::send`]; envelopes not listed were
    /// either accepted or permanently rejected.
    PartiallyAccepted { retry: Vec<usize> },
    /// Nothing was accepted and the whole batch should be retried.
    Failed,
    /// The call did not complete (network fault, throttling, server error).
    /// The whole batch should be retried, not before `retry_after` if given.
    TransientError {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The endpoint refused the batch permanently; retrying is pointless.
    Rejected { reason: String },
}

impl TransmitOutcome {
    /// Number of envelopes, out of `batch_len`, that should be retried.
    pub fn not_accepted(&self, batch_len: usize) -> usize {
        match self {
            Self::Accepted | Self::Rejected { .. } => 0,
            Self::PartiallyAccepted { retry } => retry.len().min(batch_len),
            Self::Failed | Self::TransientError { .. } => batch_len,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Performs the network call for one batch.
///
/// Called from the worker thread only, never concurrently for one
/// pipeline. Implementations must be `Sync` because the overflow store
/// replays through the same instance.
pub trait Transmitter: Send + Sync {
    fn send(&self, envelopes: &[Envelope]) -> TransmitOutcome;
}

impl<F> Transmitter for F
where
    F: Fn(&[Envelope]) -> TransmitOutcome + Send + Sync,
{
    fn send(&self, envelopes: &[Envelope]) -> TransmitOutcome {
        self(envelopes)
    }
}

/// Call `transmitter`, converting a panic into a transient error so the
/// batch is retained rather than lost.
pub(crate) fn send_guarded(
    transmitter: &dyn Transmitter,
    envelopes: &[Envelope],
) -> TransmitOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| transmitter.send(envelopes))) {
        Ok(outcome) => outcome,
        Err(_) => {
            log::error!("transmitter panicked while sending {} envelopes", envelopes.len());
            TransmitOutcome::TransientError {
                reason: "transmitter panicked".into(),
                retry_after: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TransmitOutcome::Accepted, 0)]
    #[case(TransmitOutcome::PartiallyAccepted { retry: vec![0, 3] }, 2)]
    #[case(TransmitOutcome::Failed, 5)]
    #[case(TransmitOutcome::TransientError { reason: "io".into(), retry_after: None }, 5)]
    #[case(TransmitOutcome::Rejected { reason: "400".into() }, 0)]
    fn not_accepted_counts(#[case] outcome: TransmitOutcome, #[case] expected: usize) {
        assert_eq!(outcome.not_accepted(5), expected);
    }

    #[test]
    fn panicking_transmitter_becomes_transient_error() {
        let transmitter = |_: &[Envelope]| -> TransmitOutcome { panic!("socket exploded") };
        let outcome = send_guarded(&transmitter, &[]);
        assert!(matches!(outcome, TransmitOutcome::TransientError { .. }));
    }
}
