//! Bounded multi-producer, single-consumer queue feeding the worker.
//!
//! Producers call [`BoundedQueue::enqueue`], which never blocks: a full queue
//! rejects the item immediately. Control signals travel through the same
//! channel so they are ordered after every item enqueued before them, and
//! are sent with [`BoundedQueue::enqueue_blocking`] so a shutdown request is
//! never shed the way telemetry is.

use std::time::{Duration, Instant};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError, bounded,
};

use crate::error::HandlerError;

/// Non-data markers delimiting a flush point or shutdown.
#[derive(Debug)]
pub enum ControlSignal {
    /// Acknowledged once every item ahead of it has been exported.
    SyncBarrier(Sender<()>),
    /// Drain and stop the worker.
    Exit,
}

impl ControlSignal {
    /// Create a barrier and the receiver its acknowledgement arrives on.
    pub fn barrier() -> (Self, Receiver<()>) {
        let (ack_tx, ack_rx) = bounded(1);
        (Self::SyncBarrier(ack_tx), ack_rx)
    }

    /// Release whoever waits on this signal.
    pub fn release(self) {
        if let Self::SyncBarrier(ack) = self {
            // The waiter may have timed out and dropped its receiver.
            let _ = ack.send(());
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Entries carried by the queue.
#[derive(Debug)]
pub enum QueueEntry<T> {
    Item(T),
    Signal(ControlSignal),
}

/// Result of one [`BoundedQueue::dequeue_batch`] call.
///
/// `signal`, when present, was dequeued after every entry in `items`; the
/// drain always stops at the first signal.
#[derive(Debug)]
pub struct Drained<T> {
    pub items: Vec<T>,
    pub signal: Option<ControlSignal>,
}

impl<T> Default for Drained<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            signal: None,
        }
    }
}

impl<T> Drained<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.signal.is_none()
    }
}

/// Fixed-capacity FIFO shared by producers and the worker.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<QueueEntry<T>>,
    rx: Receiver<QueueEntry<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    ///
    /// A zero capacity is raised to one; a rendezvous channel would reject
    /// every non-blocking enqueue.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Add `item` without waiting. A `false` return means the item was
    /// dropped; callers must not retry.
    pub fn enqueue(&self, item: T) -> bool {
        self.try_enqueue(item).is_ok()
    }

    /// Like [`enqueue`](Self::enqueue) but reports why the item was dropped.
    pub fn try_enqueue(&self, item: T) -> Result<(), HandlerError> {
        match self.tx.try_send(QueueEntry::Item(item)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HandlerError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(HandlerError::Closed),
        }
    }

    /// Enqueue a control signal, waiting up to `timeout` for capacity.
    pub fn enqueue_blocking(
        &self,
        signal: ControlSignal,
        timeout: Duration,
    ) -> Result<(), HandlerError> {
        match self.tx.send_timeout(QueueEntry::Signal(signal), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(HandlerError::Timeout(timeout)),
            Err(SendTimeoutError::Disconnected(_)) => Err(HandlerError::Closed),
        }
    }

    /// Collect up to `max_items` items, waiting at most `max_wait`.
    ///
    /// Returns early when `max_items` have been collected or a control
    /// signal is dequeued. The result may be empty if nothing arrived.
    /// Only the worker calls this.
    pub fn dequeue_batch(&self, max_items: usize, max_wait: Duration) -> Drained<T> {
        let deadline = Instant::now() + max_wait;
        let mut drained = Drained::default();
        while drained.items.len() < max_items {
            match self.rx.recv_deadline(deadline) {
                Ok(QueueEntry::Item(item)) => drained.items.push(item),
                Ok(QueueEntry::Signal(signal)) => {
                    drained.signal = Some(signal);
                    break;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drained
    }
}
