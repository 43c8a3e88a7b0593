//! Worker thread draining the queue into the export pipeline.
//!
//! The worker moves through `Running → Draining → Stopped`. While running it
//! repeatedly drains up to `max_batch_size` items (or whatever arrived within
//! `export_interval`) and exports them. An empty drain is still exported so
//! an idle worker keeps replaying stored blobs. A sync barrier is released
//! after the items ahead of it have been exported; an exit signal triggers a
//! final draining export and ends the thread.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, bounded};
use log::error;

use crate::{
    pipeline::ExportPipeline,
    queue::{BoundedQueue, ControlSignal, Drained},
};

/// Lifecycle of the worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Exporting the final batch and the stored backlog after an exit signal.
    Draining,
    /// Terminal; the thread has returned or is about to.
    Stopped,
}

/// Worker state readable from other threads.
#[derive(Debug, Default)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn get(&self) -> WorkerState {
        match self.0.load(Ordering::Acquire) {
            0 => WorkerState::Running,
            1 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }

    fn set(&self, state: WorkerState) {
        let raw = match state {
            WorkerState::Running => 0,
            WorkerState::Draining => 1,
            WorkerState::Stopped => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// Settings the worker needs beyond its queue and pipeline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WorkerConfig {
    pub max_batch_size: usize,
    pub export_interval: Duration,
}

/// Handles returned by [`spawn_worker`].
pub(crate) struct SpawnedWorker {
    pub handle: JoinHandle<()>,
    /// Receives one message when the worker reaches `Stopped`.
    pub done_rx: Receiver<()>,
    pub state: Arc<SharedState>,
}

/// Spawn the worker thread.
pub(crate) fn spawn_worker<T>(
    queue: Arc<BoundedQueue<T>>,
    pipeline: ExportPipeline<T>,
    config: WorkerConfig,
) -> io::Result<SpawnedWorker>
where
    T: Send + 'static,
{
    let (done_tx, done_rx) = bounded(1);
    let state = Arc::new(SharedState::default());
    let worker = Worker {
        queue,
        pipeline,
        config,
        state: Arc::clone(&state),
    };
    let handle = thread::Builder::new()
        .name("femtoexport-worker".into())
        .spawn(move || {
            worker.run();
            let _ = done_tx.send(());
        })?;
    Ok(SpawnedWorker {
        handle,
        done_rx,
        state,
    })
}

struct Worker<T> {
    queue: Arc<BoundedQueue<T>>,
    pipeline: ExportPipeline<T>,
    config: WorkerConfig,
    state: Arc<SharedState>,
}

impl<T> Worker<T> {
    fn run(mut self) {
        loop {
            let Drained { items, signal } = self
                .queue
                .dequeue_batch(self.config.max_batch_size, self.config.export_interval);
            match signal {
                None => self.export(items, None),
                Some(ControlSignal::Exit) => {
                    self.state.set(WorkerState::Draining);
                    self.export(items, Some(&ControlSignal::Exit));
                    break;
                }
                Some(barrier) => {
                    self.export(items, Some(&barrier));
                    barrier.release();
                }
            }
        }
        self.state.set(WorkerState::Stopped);
    }

    /// A panic escaping the pipeline loses this batch but not the worker.
    fn export(&mut self, items: Vec<T>, signal: Option<&ControlSignal>) {
        let count = items.len();
        let pipeline = &mut self.pipeline;
        if panic::catch_unwind(AssertUnwindSafe(|| pipeline.export(items, signal))).is_err() {
            error!("export of {count} items panicked; worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::{Envelope, EventData, Payload, schema},
        error::TransformError,
        transmitter::{TransmitOutcome, Transmitter},
    };
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<(Instant, usize)>>,
    }

    impl Transmitter for Recording {
        fn send(&self, envelopes: &[Envelope]) -> TransmitOutcome {
            self.batches.lock().push((Instant::now(), envelopes.len()));
            TransmitOutcome::Accepted
        }
    }

    fn to_event(n: u32) -> Result<Envelope, TransformError> {
        if n == u32::MAX {
            panic!("poison item");
        }
        Ok(Envelope::new(
            schema::EVENT,
            Utc::now(),
            Payload::EventData(EventData {
                ver: 2,
                name: n.to_string(),
                properties: Default::default(),
                measurements: Default::default(),
            }),
        ))
    }

    fn start(
        max_batch_size: usize,
        export_interval: Duration,
    ) -> (Arc<BoundedQueue<u32>>, Arc<Recording>, SpawnedWorker) {
        let queue = Arc::new(BoundedQueue::new(16));
        let recording = Arc::new(Recording::default());
        let pipeline = ExportPipeline::new(
            Box::new(to_event),
            Arc::clone(&recording) as Arc<dyn Transmitter>,
            None,
            max_batch_size,
            10,
        );
        let worker = spawn_worker(
            Arc::clone(&queue),
            pipeline,
            WorkerConfig {
                max_batch_size,
                export_interval,
            },
        )
        .expect("spawn worker");
        (queue, recording, worker)
    }

    fn stop(queue: &BoundedQueue<u32>, worker: SpawnedWorker) {
        queue
            .enqueue_blocking(ControlSignal::Exit, Duration::from_secs(1))
            .expect("enqueue exit");
        worker
            .done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker stopped");
        worker.handle.join().expect("join worker");
        assert_eq!(worker.state.get(), WorkerState::Stopped);
    }

    #[test]
    fn barrier_is_released_after_preceding_items_export() {
        let (queue, recording, worker) = start(10, Duration::from_secs(30));
        for i in 0..3 {
            assert!(queue.enqueue(i));
        }
        let (barrier, ack_rx) = ControlSignal::barrier();
        queue
            .enqueue_blocking(barrier, Duration::from_secs(1))
            .expect("enqueue barrier");
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("barrier acknowledged");
        let sent: usize = recording.batches.lock().iter().map(|(_, n)| n).sum();
        assert_eq!(sent, 3);
        assert_eq!(worker.state.get(), WorkerState::Running);
        stop(&queue, worker);
    }

    #[test]
    fn exit_exports_items_ahead_of_it() {
        let (queue, recording, worker) = start(10, Duration::from_secs(30));
        assert!(queue.enqueue(7));
        stop(&queue, worker);
        let sent: usize = recording.batches.lock().iter().map(|(_, n)| n).sum();
        assert_eq!(sent, 1);
    }

    #[test]
    fn worker_survives_poisoned_items() {
        let (queue, recording, worker) = start(10, Duration::from_secs(30));
        assert!(queue.enqueue(u32::MAX));
        assert!(queue.enqueue(1));
        let (barrier, ack_rx) = ControlSignal::barrier();
        queue
            .enqueue_blocking(barrier, Duration::from_secs(1))
            .expect("enqueue barrier");
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("barrier acknowledged");
        let sent: usize = recording.batches.lock().iter().map(|(_, n)| n).sum();
        assert_eq!(sent, 1);
        stop(&queue, worker);
    }

    #[test]
    fn batches_are_size_then_time_triggered() {
        let interval = Duration::from_millis(500);
        let (queue, recording, worker) = start(2, interval);
        let started = Instant::now();
        for i in 0..3 {
            assert!(queue.enqueue(i));
        }
        thread::sleep(interval * 3);
        let batches = recording.batches.lock().clone();
        let sizes: Vec<_> = batches.iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(batches[0].0.duration_since(started) < interval);
        assert!(batches[1].0.duration_since(started) >= interval);
        stop(&queue, worker);
    }
}
