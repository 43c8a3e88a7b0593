//! On-disk blob files.
//!
//! Each blob holds one batch of envelopes plus the time it was written. File
//! names start with the creation timestamp so a plain lexicographic sort
//! yields oldest-first order, including after a restart:
//!
//! ```text
//! 2026-10-16T120000.123456-9f3a01bc.blob
//! 2026-10-16T120000.123456-9f3a01bc.blob@2026-10-16T120030.000000.lock
//! ```
//!
//! The second form is a leased blob: it is not eligible for replay until the
//! instant after `@` has passed. Blobs are written to a temporary file in
//! the same directory and renamed into place, so a crash never leaves a
//! truncated `.blob` behind.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder as TempBuilder;

use crate::{envelope::Envelope, error::StorageError};

pub(crate) const BLOB_SUFFIX: &str = ".blob";
pub(crate) const LOCK_SUFFIX: &str = ".lock";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";
const LEASE_SEPARATOR: char = '@';

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%dT%H%M%S%.f";

pub(crate) fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_PARSE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Envelopes read back from a blob file. The `written_at` stamp stored
/// beside them is informational and not read.
#[derive(Debug, Deserialize)]
pub(crate) struct BlobContents {
    pub envelopes: Vec<Envelope>,
}

#[derive(Serialize)]
struct BlobContentsRef<'a> {
    written_at: DateTime<Utc>,
    envelopes: &'a [Envelope],
}

/// Serialise a blob, refusing envelopes that would not read back.
pub(crate) fn encode(
    written_at: DateTime<Utc>,
    envelopes: &[Envelope],
) -> Result<Vec<u8>, StorageError> {
    if let Some((index, field)) = envelopes
        .iter()
        .enumerate()
        .find_map(|(i, e)| e.non_finite_field().map(|field| (i, field)))
    {
        return Err(StorageError::NonFinite { index, field });
    }
    Ok(serde_json::to_vec(&BlobContentsRef {
        written_at,
        envelopes,
    })?)
}

/// Atomically write `bytes` to `dest` via a temporary file in `dir`.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    use std::io::Write;

    let mut tmp = TempBuilder::new()
        .prefix(".pending-")
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|err| StorageError::Io(err.error))?;
    Ok(())
}

/// A batch persisted in the overflow store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredBlob {
    path: PathBuf,
    created: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
    size: u64,
}

impl StoredBlob {
    /// File name for a fresh blob created at `created`.
    pub(crate) fn file_name(created: DateTime<Utc>, discriminator: u32) -> String {
        format!(
            "{}-{discriminator:08x}{BLOB_SUFFIX}",
            format_timestamp(created)
        )
    }

    /// Recognise a blob file by name. Returns `None` for anything else.
    pub(crate) fn from_path(path: PathBuf, size: u64) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (base, lease_until) = match name.split_once(LEASE_SEPARATOR) {
            Some((base, lease)) => {
                let lease = lease.strip_suffix(LOCK_SUFFIX)?;
                (base, Some(parse_timestamp(lease)?))
            }
            None => (name, None),
        };
        let stem = base.strip_suffix(BLOB_SUFFIX)?;
        let (stamp, _discriminator) = stem.rsplit_once('-')?;
        let created = parse_timestamp(stamp)?;
        Some(Self {
            path,
            created,
            lease_until,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When the blob was first written.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// End of the current lease, if the blob is leased.
    pub fn lease_until(&self) -> Option<DateTime<Utc>> {
        self.lease_until
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }

    pub(crate) fn read(&self) -> Result<BlobContents, StorageError> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace the blob's contents, keeping its name and creation time.
    pub(crate) fn rewrite(&mut self, envelopes: &[Envelope]) -> Result<(), StorageError> {
        let bytes = encode(Utc::now(), envelopes)?;
        let dir = self
            .path
            .parent()
            .ok_or_else(|| StorageError::BadName(self.path.display().to_string()))?
            .to_path_buf();
        write_atomic(&dir, &self.path, &bytes)?;
        self.size = bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn delete(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn base_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let base = name
            .split_once(LEASE_SEPARATOR)
            .map_or(name, |(base, _)| base);
        self.path.with_file_name(base)
    }

    /// Hide the blob from replay until `until`.
    pub(crate) fn lease(&mut self, until: DateTime<Utc>) -> io::Result<()> {
        let base = self.base_path();
        let mut name = base.file_name().unwrap_or_default().to_os_string();
        name.push(format!("{LEASE_SEPARATOR}{}{LOCK_SUFFIX}", format_timestamp(until)));
        let leased = base.with_file_name(name);
        fs::rename(&self.path, &leased)?;
        self.path = leased;
        self.lease_until = Some(until);
        Ok(())
    }

    /// Drop an expired lease so the blob is eligible again.
    pub(crate) fn release(&mut self) -> io::Result<()> {
        if self.lease_until.is_none() {
            return Ok(());
        }
        let base = self.base_path();
        fs::rename(&self.path, &base)?;
        self.path = base;
        self.lease_until = None;
        Ok(())
    }
}
