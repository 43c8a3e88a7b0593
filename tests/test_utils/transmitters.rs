//! In-process transmitters recording what the pipeline sends.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use femtoexport::{Envelope, Payload, TransmitOutcome, Transmitter};
use parking_lot::Mutex;

/// One transmit call as observed by [`RecordingTransmitter`].
#[derive(Clone, Debug)]
pub struct SentBatch {
    pub at: Instant,
    pub names: Vec<String>,
}

/// Records every batch and answers from a script, then from `fallback`.
pub struct RecordingTransmitter {
    script: Mutex<VecDeque<TransmitOutcome>>,
    fallback: TransmitOutcome,
    batches: Mutex<Vec<SentBatch>>,
}

impl RecordingTransmitter {
    pub fn scripted(script: Vec<TransmitOutcome>, fallback: TransmitOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn always(outcome: TransmitOutcome) -> Arc<Self> {
        Self::scripted(Vec::new(), outcome)
    }

    pub fn accepting() -> Arc<Self> {
        Self::always(TransmitOutcome::Accepted)
    }

    pub fn batches(&self) -> Vec<SentBatch> {
        self.batches.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().len()
    }

    /// Names of every envelope sent, in call order.
    pub fn sent_names(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.names.iter().cloned())
            .collect()
    }
}

impl Transmitter for RecordingTransmitter {
    fn send(&self, envelopes: &[Envelope]) -> TransmitOutcome {
        self.batches.lock().push(SentBatch {
            at: Instant::now(),
            names: envelopes.iter().map(envelope_name).collect(),
        });
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Event name, message text, or metric name carried by `envelope`.
pub fn envelope_name(envelope: &Envelope) -> String {
    match &envelope.data {
        Payload::EventData(data) => data.name.clone(),
        Payload::MessageData(data) => data.message.clone(),
        Payload::ExceptionData(data) => data
            .exceptions
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_default(),
        Payload::MetricData(data) => data
            .metrics
            .first()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
    }
}
