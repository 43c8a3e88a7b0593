//! Disk-backed overflow store for batches that could not be delivered.
//!
//! Each failed batch becomes one blob file (see [`blob`]). The store keeps
//! the directory under a byte cap by evicting the oldest blobs first,
//! replays blobs oldest-first when the endpoint is healthy again, and runs
//! a periodic maintenance sweep on its own thread. Every operation holds a
//! single mutex, so persist, replay, and maintenance never interleave.
//! Blobs survive a restart; a new store opened on the same directory picks
//! them up.

mod blob;
mod maintenance;

pub use blob::StoredBlob;
pub use maintenance::MaintenanceReport;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;

use self::{
    blob::{TEMP_SUFFIX, encode, write_atomic},
    maintenance::{MaintenanceTask, sweep_logged},
};
use crate::{
    config::StorageConfig,
    envelope::Envelope,
    error::StorageError,
    transmitter::{TransmitOutcome, Transmitter, send_guarded},
};

/// Snapshot of the store's footprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Blob files, leased or not.
    pub blob_count: usize,
    /// Blobs currently hidden from replay by a lease.
    pub leased_count: usize,
    /// Bytes used by every file in the directory.
    pub total_bytes: u64,
}

#[derive(Default)]
struct Scan {
    blobs: Vec<StoredBlob>,
    temp: Vec<(PathBuf, Option<SystemTime>)>,
    total_bytes: u64,
}

struct StoreInner {
    dir: PathBuf,
    max_size: u64,
    retention: Duration,
    write_timeout: Duration,
    last_created: Option<DateTime<Utc>>,
}

impl StoreInner {
    /// Creation stamps are strictly increasing within one store so names
    /// sort in write order even when the clock stalls.
    fn next_created(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created = match self.last_created {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(created);
        created
    }

    fn retention_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let retention = chrono::Duration::from_std(self.retention).ok()?;
        now.checked_sub_signed(retention)
    }

    fn scan(&self) -> Result<Scan, StorageError> {
        let mut scan = Scan::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            // Files may vanish between listing and stat.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            scan.total_bytes += meta.len();
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if is_temp {
                scan.temp.push((path, meta.modified().ok()));
            } else if let Some(blob) = StoredBlob::from_path(path, meta.len()) {
                scan.blobs.push(blob);
            }
        }
        scan.blobs.sort_by(|a, b| {
            a.created()
                .cmp(&b.created())
                .then_with(|| a.path().cmp(b.path()))
        });
        Ok(scan)
    }

    fn persist(
        &mut self,
        envelopes: &[Envelope],
        lease_until: Option<DateTime<Utc>>,
    ) -> Result<StoredBlob, StorageError> {
        let created = self.next_created();
        let bytes = encode(created, envelopes)?;
        let size = bytes.len() as u64;
        if size > self.max_size {
            return Err(StorageError::Oversized {
                size,
                limit: self.max_size,
            });
        }
        fs::create_dir_all(&self.dir)?;

        let scan = self.scan()?;
        let mut total = scan.total_bytes;
        let mut evicted = 0usize;
        for blob in &scan.blobs {
            if total + size <= self.max_size {
                break;
            }
            match blob.delete() {
                Ok(()) => {
                    total = total.saturating_sub(blob.size());
                    evicted += 1;
                }
                Err(err) => warn!("failed to evict {}: {err}", blob.path().display()),
            }
        }
        if evicted > 0 {
            warn!("overflow store at capacity; evicted {evicted} oldest blob(s)");
        }
        if total + size > self.max_size {
            return Err(StorageError::Full {
                needed: size,
                available: self.max_size.saturating_sub(total),
            });
        }

        let name = StoredBlob::file_name(created, rand::thread_rng().r#gen());
        let path = self.dir.join(&name);
        write_atomic(&self.dir, &path, &bytes)?;
        let mut blob =
            StoredBlob::from_path(path, size).ok_or_else(|| StorageError::BadName(name))?;
        if let Some(until) = lease_until {
            blob.lease(until)?;
        }
        Ok(blob)
    }

    fn replay(
        &mut self,
        limit: usize,
        transmitter: &dyn Transmitter,
    ) -> Result<usize, StorageError> {
        let now = Utc::now();
        let deadline = self.retention_deadline(now);
        let mut sent = 0usize;
        for mut blob in self.scan()?.blobs {
            if sent >= limit {
                break;
            }
            if deadline.is_some_and(|d| blob.created() < d) {
                warn!("discarding stored blob {} past retention", blob.path().display());
                blob.delete()?;
                continue;
            }
            if blob.is_leased(now) {
                continue;
            }
            let envelopes = match blob.read() {
                Ok(contents) => contents.envelopes,
                Err(err) => {
                    warn!("discarding unreadable blob {}: {err}", blob.path().display());
                    blob.delete()?;
                    continue;
                }
            };
            if envelopes.is_empty() {
                blob.delete()?;
                continue;
            }

            match send_guarded(transmitter, &envelopes) {
                TransmitOutcome::Accepted => {
                    blob.delete()?;
                    sent += 1;
                }
                TransmitOutcome::Rejected { reason } => {
                    warn!(
                        "endpoint rejected {} stored envelopes permanently: {reason}",
                        envelopes.len()
                    );
                    blob.delete()?;
                    break;
                }
                TransmitOutcome::PartiallyAccepted { mut retry } => {
                    retry.sort_unstable();
                    retry.dedup();
                    let remaining: Vec<Envelope> = retry
                        .into_iter()
                        .filter_map(|i| envelopes.get(i).cloned())
                        .collect();
                    if remaining.is_empty() {
                        blob.delete()?;
                    } else {
                        blob.rewrite(&remaining)?;
                    }
                    break;
                }
                TransmitOutcome::Failed => break,
                TransmitOutcome::TransientError { reason, retry_after } => {
                    debug!("replay paused: {reason}");
                    if let Some(until) = lease_deadline(retry_after) {
                        blob.lease(until)?;
                    }
                    break;
                }
            }
        }
        Ok(sent)
    }
}

pub(crate) fn lease_deadline(retry_after: Option<Duration>) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(retry_after?).ok()?;
    Utc::now().checked_add_signed(delay)
}

/// Durable store for undelivered batches.
pub struct OverflowStore {
    dir: PathBuf,
    inner: Arc<Mutex<StoreInner>>,
    maintenance: Mutex<Option<MaintenanceTask>>,
}

impl OverflowStore {
    /// Open (creating if needed) the store at `config.path`, run one
    /// maintenance sweep and start the periodic maintenance thread.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.path)?;
        let inner = Arc::new(Mutex::new(StoreInner {
            dir: config.path.clone(),
            max_size: config.max_size,
            retention: config.retention_period,
            write_timeout: config.write_timeout,
            last_created: None,
        }));
        sweep_logged(&inner);
        let task = MaintenanceTask::spawn(Arc::clone(&inner), config.maintenance_period)?;
        Ok(Self {
            dir: config.path.clone(),
            inner,
            maintenance: Mutex::new(Some(task)),
        })
    }

    /// Directory holding the blobs.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `envelopes` as a new blob, evicting the oldest blobs if the
    /// byte cap would otherwise be exceeded.
    ///
    /// Fails with [`StorageError::Oversized`] when the batch alone is larger
    /// than the cap; nothing is evicted in that case.
    pub fn persist(&self, envelopes: &[Envelope]) -> Result<StoredBlob, StorageError> {
        self.inner.lock().persist(envelopes, None)
    }

    /// Like [`persist`](Self::persist) but hides the blob from replay for
    /// `lease`.
    pub fn persist_leased(
        &self,
        envelopes: &[Envelope],
        lease: Duration,
    ) -> Result<StoredBlob, StorageError> {
        let until = lease_deadline(Some(lease));
        self.inner.lock().persist(envelopes, until)
    }

    /// Re-transmit up to `limit` stored blobs, oldest first.
    ///
    /// Accepted blobs are deleted. Replay stops at the first blob that is
    /// not fully accepted: a partial result rewrites that blob with the
    /// envelopes still to retry, and a transient error carrying a retry
    /// delay leases it. Unreadable and expired blobs are deleted on sight.
    /// Returns the number of blobs delivered.
    pub fn replay_oldest(&self, limit: usize, transmitter: &dyn Transmitter) -> usize {
        let mut inner = self.inner.lock();
        match inner.replay(limit, transmitter) {
            Ok(sent) => sent,
            Err(err) => {
                warn!("replay from {} failed: {err}", inner.dir.display());
                0
            }
        }
    }

    /// Run one maintenance sweep now.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        sweep_logged(&self.inner)
    }

    /// Blobs currently on disk, oldest first.
    pub fn blobs(&self) -> Result<Vec<StoredBlob>, StorageError> {
        Ok(self.inner.lock().scan()?.blobs)
    }

    pub fn stats(&self) -> StorageStats {
        let inner = self.inner.lock();
        match inner.scan() {
            Ok(scan) => {
                let now = Utc::now();
                StorageStats {
                    blob_count: scan.blobs.len(),
                    leased_count: scan.blobs.iter().filter(|b| b.is_leased(now)).count(),
                    total_bytes: scan.total_bytes,
                }
            }
            Err(err) => {
                warn!("failed to scan {}: {err}", inner.dir.display());
                StorageStats::default()
            }
        }
    }

    /// Stop the maintenance thread. Stored blobs are kept. Idempotent.
    pub fn close(&self) {
        if let Some(mut task) = self.maintenance.lock().take() {
            task.stop();
        }
    }
}

impl Drop for OverflowStore {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OverflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowStore")
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventData, Payload, schema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use filetime::{FileTime, set_file_mtime};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    fn envelope(name: &str) -> Envelope {
        Envelope::new(
            schema::EVENT,
            Utc::now(),
            Payload::EventData(EventData {
                ver: 2,
                name: name.into(),
                properties: Default::default(),
                measurements: Default::default(),
            }),
        )
    }

    fn names(envelopes: &[Envelope]) -> Vec<String> {
        envelopes
            .iter()
            .map(|e| match &e.data {
                Payload::EventData(data) => data.name.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[fixture]
    fn dir() -> TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            maintenance_period: Duration::from_secs(3600),
            ..StorageConfig::at(dir.path())
        }
    }

    #[rstest]
    fn persisted_blobs_survive_reopen(dir: TempDir) {
        {
            let store = OverflowStore::open(&config(&dir)).expect("open");
            store.persist(&[envelope("a")]).expect("persist a");
            store.persist(&[envelope("b")]).expect("persist b");
        }
        let store = OverflowStore::open(&config(&dir)).expect("reopen");
        let blobs = store.blobs().expect("list");
        assert_eq!(blobs.len(), 2);
        assert!(blobs[0].created() < blobs[1].created());
        assert_eq!(names(&blobs[0].read().expect("read").envelopes), ["a"]);
    }

    #[rstest]
    fn oversized_batch_is_refused_without_eviction(dir: TempDir) {
        let store = OverflowStore::open(&StorageConfig {
            max_size: 1024,
            ..config(&dir)
        })
        .expect("open");
        store.persist(&[envelope("small")]).expect("fits");
        let huge: Vec<_> = (0..50).map(|i| envelope(&format!("item-{i}"))).collect();
        let err = store.persist(&huge).expect_err("too large");
        assert!(matches!(err, StorageError::Oversized { .. }));
        assert_eq!(store.stats().blob_count, 1);
    }

    #[rstest]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn non_finite_measurements_are_refused_before_writing(dir: TempDir, #[case] value: f64) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        let mut bad = envelope("bad");
        if let Payload::EventData(data) = &mut bad.data {
            data.measurements.insert("m".into(), value);
        }
        let err = store
            .persist(&[envelope("fine"), bad])
            .expect_err("non-finite value");
        let StorageError::NonFinite { index, field } = &err else {
            panic!("expected non-finite error, got {err}");
        };
        assert_eq!((*index, field.as_str()), (1, "measurements.m"));
        assert_eq!(store.stats().blob_count, 0);

        // Blobs that were written always replay.
        store.persist(&[envelope("fine")]).expect("persist");
        let calls = AtomicUsize::new(0);
        let transmitter = |_: &[Envelope]| {
            calls.fetch_add(1, Ordering::SeqCst);
            TransmitOutcome::Accepted
        };
        assert_eq!(store.replay_oldest(10, &transmitter), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn eviction_removes_oldest_first(dir: TempDir) {
        let one_blob = encode(Utc::now(), &[envelope("size-0")])
            .expect("encode")
            .len() as u64;
        let store = OverflowStore::open(&StorageConfig {
            max_size: one_blob * 2 + one_blob / 2,
            ..config(&dir)
        })
        .expect("open");
        for name in ["first-0", "second", "third-0"] {
            store.persist(&[envelope(name)]).expect("persist");
        }
        let blobs = store.blobs().expect("list");
        let kept: Vec<_> = blobs
            .iter()
            .flat_map(|b| names(&b.read().expect("read").envelopes))
            .collect();
        assert_eq!(kept, ["second", "third-0"]);
        assert!(store.stats().total_bytes <= one_blob * 2 + one_blob / 2);
    }

    #[rstest]
    fn replay_sends_oldest_first_and_deletes(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        for name in ["a", "b", "c"] {
            store.persist(&[envelope(name)]).expect("persist");
        }
        let seen = Mutex::new(Vec::new());
        let transmitter = |batch: &[Envelope]| {
            seen.lock().extend(names(batch));
            TransmitOutcome::Accepted
        };
        assert_eq!(store.replay_oldest(2, &transmitter), 2);
        assert_eq!(*seen.lock(), ["a", "b"]);
        assert_eq!(store.stats().blob_count, 1);
    }

    #[rstest]
    fn replay_stops_at_first_failure(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        store.persist(&[envelope("a")]).expect("persist");
        store.persist(&[envelope("b")]).expect("persist");
        let calls = AtomicUsize::new(0);
        let transmitter = |_: &[Envelope]| {
            calls.fetch_add(1, Ordering::SeqCst);
            TransmitOutcome::Failed
        };
        assert_eq!(store.replay_oldest(10, &transmitter), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().blob_count, 2);
    }

    #[rstest]
    fn partial_replay_rewrites_blob_with_remaining_envelopes(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        store
            .persist(&[envelope("a"), envelope("b"), envelope("c")])
            .expect("persist");
        let transmitter =
            |_: &[Envelope]| TransmitOutcome::PartiallyAccepted { retry: vec![1, 7] };
        assert_eq!(store.replay_oldest(10, &transmitter), 0);
        let blobs = store.blobs().expect("list");
        assert_eq!(blobs.len(), 1);
        assert_eq!(names(&blobs[0].read().expect("read").envelopes), ["b"]);
    }

    #[rstest]
    fn throttled_replay_leases_the_blob(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        store.persist(&[envelope("a")]).expect("persist");
        let throttled = |_: &[Envelope]| TransmitOutcome::TransientError {
            reason: "429".into(),
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(store.replay_oldest(10, &throttled), 0);
        assert_eq!(store.stats().leased_count, 1);

        let calls = AtomicUsize::new(0);
        let counting = |_: &[Envelope]| {
            calls.fetch_add(1, Ordering::SeqCst);
            TransmitOutcome::Accepted
        };
        assert_eq!(store.replay_oldest(10, &counting), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn maintenance_releases_expired_leases(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        store
            .persist_leased(&[envelope("a")], Duration::from_millis(1))
            .expect("persist");
        std::thread::sleep(Duration::from_millis(20));
        let report = store.run_maintenance();
        assert_eq!(report.released, 1);
        let blobs = store.blobs().expect("list");
        assert!(blobs[0].lease_until().is_none());
    }

    #[rstest]
    fn maintenance_deletes_blobs_past_retention(dir: TempDir) {
        let store = OverflowStore::open(&StorageConfig {
            retention_period: Duration::from_millis(50),
            ..config(&dir)
        })
        .expect("open");
        store.persist(&[envelope("old")]).expect("persist");
        std::thread::sleep(Duration::from_millis(100));
        let report = store.run_maintenance();
        assert_eq!(report.expired, 1);
        assert_eq!(store.stats().blob_count, 0);
    }

    #[rstest]
    fn maintenance_removes_stale_temp_files_only(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        let stale = dir.path().join(".pending-stale.tmp");
        let fresh = dir.path().join(".pending-fresh.tmp");
        fs::write(&stale, b"partial").expect("write stale");
        fs::write(&fresh, b"partial").expect("write fresh");
        let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);
        set_file_mtime(&stale, old).expect("age stale file");

        let report = store.run_maintenance();
        assert_eq!(report.orphans_removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[rstest]
    fn maintenance_recreates_a_deleted_directory(dir: TempDir) {
        let root = dir.path().join("store");
        let store = OverflowStore::open(&StorageConfig {
            maintenance_period: Duration::from_secs(3600),
            ..StorageConfig::at(&root)
        })
        .expect("open");
        fs::remove_dir_all(&root).expect("remove");
        store.run_maintenance();
        assert!(root.is_dir());
        store.persist(&[envelope("a")]).expect("persist after recreate");
    }

    #[rstest]
    fn corrupt_blobs_are_discarded_on_replay(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        let blob = store.persist(&[envelope("a")]).expect("persist");
        fs::write(blob.path(), b"{not json").expect("corrupt");
        let transmitter = |_: &[Envelope]| TransmitOutcome::Accepted;
        assert_eq!(store.replay_oldest(10, &transmitter), 0);
        assert_eq!(store.stats().blob_count, 0);
    }

    #[rstest]
    fn close_keeps_blobs(dir: TempDir) {
        let store = OverflowStore::open(&config(&dir)).expect("open");
        store.persist(&[envelope("a")]).expect("persist");
        store.close();
        store.close();
        assert_eq!(store.stats().blob_count, 1);
    }
}
