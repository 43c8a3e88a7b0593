//! Periodic retention sweeps over the overflow store.
//!
//! A sweep deletes blobs older than the retention period, renames blobs
//! whose lease has expired back to their plain name, and removes temporary
//! files abandoned by an interrupted write. It runs once when the store is
//! opened and then on a dedicated thread every maintenance period.

use std::{
    fs, io,
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, SystemTime},
};

use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, warn};
use parking_lot::Mutex;

use super::StoreInner;
use crate::error::StorageError;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Blobs deleted for exceeding the retention period.
    pub expired: usize,
    /// Leases that had run out and were released.
    pub released: usize,
    /// Orphaned temporary files removed.
    pub orphans_removed: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0 && self.released == 0 && self.orphans_removed == 0
    }
}

fn remove_quietly(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Run one sweep. The directory is recreated first if it was removed
/// from under the store.
pub(super) fn sweep(inner: &mut StoreInner) -> Result<MaintenanceReport, StorageError> {
    fs::create_dir_all(&inner.dir)?;
    let now = Utc::now();
    let deadline = inner.retention_deadline(now);
    let scan = inner.scan()?;
    let mut report = MaintenanceReport::default();

    for mut blob in scan.blobs {
        if deadline.is_some_and(|d| blob.created() < d) {
            match blob.delete() {
                Ok(()) => {
                    warn!(
                        "deleting stored blob {} past retention",
                        blob.path().display()
                    );
                    report.expired += 1;
                }
                Err(err) => warn!("failed to delete {}: {err}", blob.path().display()),
            }
            continue;
        }
        if blob.lease_until().is_some() && !blob.is_leased(now) {
            match blob.release() {
                Ok(()) => report.released += 1,
                Err(err) => warn!("failed to release lease on {}: {err}", blob.path().display()),
            }
        }
    }

    let stale_before = SystemTime::now().checked_sub(inner.write_timeout);
    for (path, modified) in scan.temp {
        let stale = matches!((modified, stale_before), (Some(m), Some(limit)) if m < limit);
        if !stale {
            continue;
        }
        match remove_quietly(&path) {
            Ok(()) => report.orphans_removed += 1,
            Err(err) => warn!("failed to remove orphaned {}: {err}", path.display()),
        }
    }
    Ok(report)
}

pub(super) fn sweep_logged(inner: &Mutex<StoreInner>) -> MaintenanceReport {
    let mut guard = inner.lock();
    match sweep(&mut guard) {
        Ok(report) => {
            if !report.is_empty() {
                debug!("storage maintenance: {report:?}");
            }
            report
        }
        Err(err) => {
            warn!(
                "storage maintenance failed for {}: {err}",
                guard.dir.display()
            );
            MaintenanceReport::default()
        }
    }
}

/// Background thread driving [`sweep`] on a fixed period.
pub(super) struct MaintenanceTask {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceTask {
    pub(super) fn spawn(inner: Arc<Mutex<StoreInner>>, period: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("femtoexport-maintenance".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep_logged(&inner);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it. Idempotent.
    pub(super) fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("storage maintenance thread panicked");
        }
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.stop();
    }
}
