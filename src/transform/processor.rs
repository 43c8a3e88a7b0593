//! Post-transform processor chain.

use std::panic::{self, AssertUnwindSafe};

use log::warn;

use crate::envelope::Envelope;

/// Callback applied to every envelope before transmission.
///
/// Returning `false` discards the envelope.
pub trait TelemetryProcessor: Send {
    fn process(&self, envelope: &mut Envelope) -> bool;
}

impl<F> TelemetryProcessor for F
where
    F: Fn(&mut Envelope) -> bool + Send,
{
    fn process(&self, envelope: &mut Envelope) -> bool {
        self(envelope)
    }
}

/// Ordered list of processors.
///
/// A processor that panics is logged and treated as having accepted the
/// envelope, so one faulty callback cannot silence all telemetry.
#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn TelemetryProcessor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Box<dyn TelemetryProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run every processor over `envelopes`, keeping those all of them accept.
    pub fn apply(&self, envelopes: Vec<Envelope>) -> Vec<Envelope> {
        if self.processors.is_empty() {
            return envelopes;
        }
        envelopes
            .into_iter()
            .filter_map(|mut envelope| self.accepts(&mut envelope).then_some(envelope))
            .collect()
    }

    fn accepts(&self, envelope: &mut Envelope) -> bool {
        for (index, processor) in self.processors.iter().enumerate() {
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| processor.process(envelope)));
            match verdict {
                Ok(true) => {}
                Ok(false) => return false,
                Err(_) => warn!("telemetry processor #{index} panicked; keeping envelope"),
            }
        }
        true
    }
}

impl std::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorChain")
            .field("processors", &self.processors.len())
            .finish()
    }
}
