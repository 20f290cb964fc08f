//! Persistent state store with atomic writes and an exclusive-lock
//! discipline.
//!
//! All mutation of the store file goes through [`StateStore::update`], which
//! holds an advisory lock on a sentinel file (`store.lock`, distinct from
//! the data file) for the whole read-modify-write, serializes to a temp
//! file, fsyncs, and atomically renames over `state.json`. A failed write
//! removes the temp file and leaves the original untouched; a half-written
//! store file is never visible.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ReleaseState, RunReceipt};

/// Current store schema version. Unknown versions are rejected, never
/// guessed at.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Current receipt schema version.
pub const RECEIPT_VERSION: &str = "slipway.receipt.v1";

pub const STATE_FILE: &str = "state.json";
pub const RECEIPT_FILE: &str = "receipt.json";
pub const STORE_LOCK_FILE: &str = "store.lock";

/// Fatal store conditions. Both require operator intervention; the engine
/// aborts before touching any release when it hits one.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "state file {path} has schema version {found}, but this build supports only {CURRENT_SCHEMA_VERSION}"
    )]
    UnknownSchema { path: PathBuf, found: u32 },
}

/// The root persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFile {
    pub schema_version: u32,
    #[serde(default)]
    pub entries: std::collections::BTreeMap<String, ReleaseState>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            entries: std::collections::BTreeMap::new(),
        }
    }
}

/// Handle to the on-disk store. Cheap to construct; every operation opens,
/// locks, and releases on its own, so no long-lived in-memory copy exists.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        Ok(Self { state_dir: state_dir.to_path_buf() })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn store_lock_path(&self) -> PathBuf {
        self.state_dir.join(STORE_LOCK_FILE)
    }

    /// Read the current document without mutating it.
    ///
    /// Takes the same lock as [`StateStore::update`]: the atomic rename
    /// already guarantees a consistent file, but callers composing several
    /// logical reads still must not interleave with a concurrent update.
    pub fn snapshot(&self) -> Result<StoreFile> {
        let _guard = self.acquire_store_lock()?;
        self.read_unlocked()
    }

    /// Apply `mutator` to the document under the store lock and persist the
    /// result atomically. If the mutator or the write fails, the original
    /// file is left byte-for-byte unchanged.
    pub fn update<T>(&self, mutator: impl FnOnce(&mut StoreFile) -> Result<T>) -> Result<T> {
        let _guard = self.acquire_store_lock()?;
        let mut doc = self.read_unlocked()?;
        let out = mutator(&mut doc)?;
        doc.schema_version = CURRENT_SCHEMA_VERSION;
        atomic_write_json(&self.state_path(), &doc)?;
        Ok(out)
    }

    fn acquire_store_lock(&self) -> Result<File> {
        let path = self.store_lock_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open store lock {}", path.display()))?;
        // Blocking acquire: contention is bounded by one serialize+rename
        // from another in-process update.
        file.lock_exclusive()
            .with_context(|| format!("failed to lock store lock {}", path.display()))?;
        // The advisory lock is released when `file` is dropped.
        Ok(file)
    }

    fn read_unlocked(&self) -> Result<StoreFile> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(StoreFile::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        let doc: StoreFile = serde_json::from_str(&content)
            .map_err(|source| StateError::Corrupt { path: path.clone(), source })?;
        if doc.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(StateError::UnknownSchema { path, found: doc.schema_version }.into());
        }
        Ok(doc)
    }
}

pub fn receipt_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RECEIPT_FILE)
}

pub fn write_receipt(state_dir: &Path, receipt: &RunReceipt) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    atomic_write_json(&receipt_path(state_dir), receipt)
}

pub fn load_receipt(state_dir: &Path) -> Result<Option<RunReceipt>> {
    let path = receipt_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read receipt file {}", path.display()))?;
    let receipt: RunReceipt = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse receipt JSON {}", path.display()))?;
    Ok(Some(receipt))
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are silently ignored
/// because not all platforms support opening a directory for sync.
pub(crate) fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    if let Err(err) = write_and_rename(&tmp, path, &data) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    fsync_parent_dir(path);
    Ok(())
}

fn write_and_rename(tmp: &Path, path: &Path, data: &[u8]) -> Result<()> {
    {
        let mut f = fs::File::create(tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(tmp, path).with_context(|| {
        format!("failed to rename tmp file {} to {}", tmp.display(), path.display())
    })
}
