// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed key-value store for state that must survive restarts.
//!
//! Each record is a JSON document at `<root>/<collection>/<key>.json`. Writers
//! hold an exclusive lock on `<root>/.lock` for the whole temp-file + rename
//! sequence; readers take a shared lock. Records are plain serde structs, so
//! unknown fields written by newer versions are ignored on read.
//!
//! The `*_async` variants run the same file work on tokio's blocking pool and
//! are what async code should call.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Durable JSON document store rooted at a directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl JsonStore {
    /// Open (and create if needed) a store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create state directory: {:?}", root))?;
        Ok(Self {
            root,
            lock_timeout: LOCK_TIMEOUT,
        })
    }

    /// Default store under `~/.modelfetch/state`.
    pub fn default_location() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".modelfetch").join("state"))
            .unwrap_or_else(|| PathBuf::from(".modelfetch/state"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    fn record_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.json", sanitize_key(key)))
    }

    /// Load a record, `Ok(None)` when it does not exist.
    pub fn load<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        let path = self.record_path(collection, key);
        if !path.exists() {
            return Ok(None);
        }

        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {:?}", path))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", path))?;
        Ok(Some(value))
    }

    /// Write a record atomically.
    pub fn save<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .with_context(|| "Failed to serialize state to JSON")?;
        self.write_document(collection, key, &content)
    }

    /// [`save`](Self::save) off the async runtime's worker threads.
    pub async fn save_async<T: Serialize>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .with_context(|| "Failed to serialize state to JSON")?;
        let store = self.clone();
        let (collection, key) = (collection.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || store.write_document(&collection, &key, &content))
            .await
            .context("State writer task failed")?
    }

    /// [`load`](Self::load) off the async runtime's worker threads.
    pub async fn load_async<T>(&self, collection: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let store = self.clone();
        let (collection, key) = (collection.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || store.load(&collection, &key))
            .await
            .context("State reader task failed")?
    }

    /// [`remove`](Self::remove) off the async runtime's worker threads.
    pub async fn remove_async(&self, collection: &str, key: &str) -> Result<()> {
        let store = self.clone();
        let (collection, key) = (collection.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || store.remove(&collection, &key))
            .await
            .context("State writer task failed")?
    }

    /// [`load_all`](Self::load_all) off the async runtime's worker threads.
    pub async fn load_all_async<T>(&self, collection: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let store = self.clone();
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || store.load_all(&collection))
            .await
            .context("State reader task failed")?
    }

    fn write_document(&self, collection: &str, key: &str, content: &str) -> Result<()> {
        let path = self.record_path(collection, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path).with_context(|| {
            format!("Failed to rename temp file to state file: {:?} -> {:?}", temp_path, path)
        })?;
        Ok(())
    }

    /// Delete a record. Deleting a missing record is not an error.
    pub fn remove(&self, collection: &str, key: &str) -> Result<()> {
        let path = self.record_path(collection, key);
        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove state file: {:?}", path)),
        }
    }

    /// Load every record of a collection. Unparseable records are skipped with a warning.
    pub fn load_all<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<T>(&c).map_err(anyhow::Error::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable state record: {}", e),
            }
        }
        Ok(records)
    }
}

/// Exclusive claim on one record, held for as long as this value lives.
///
/// Backed by an OS file lock on `<root>/<collection>/<key>.lock`, so it is
/// released when the owning process exits, however it exits.
#[derive(Debug)]
pub struct Lease {
    _file: File,
    path: PathBuf,
}

impl Lease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JsonStore {
    fn lease_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root
            .join(collection)
            .join(format!("{}.lock", sanitize_key(key)))
    }

    /// Claim `key` without waiting. `Ok(None)` when another holder has it,
    /// in this process or another one.
    pub fn try_lease(&self, collection: &str, key: &str) -> Result<Option<Lease>> {
        let path = self.lease_path(collection, key);
        let file = open_lock_file(&path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Lease { _file: file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {:?}", path)),
        }
    }

    /// Whether some holder currently has a lease on `key`.
    pub fn is_leased(&self, collection: &str, key: &str) -> Result<bool> {
        let path = self.lease_path(collection, key);
        if !path.exists() {
            return Ok(false);
        }
        Ok(self.try_lease(collection, key)?.is_none())
    }

    /// Delete the lease file of a record that is gone for good.
    pub fn remove_lease_file(&self, collection: &str, key: &str) {
        let path = self.lease_path(collection, key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), "Failed to remove lease file: {}", e);
            }
        }
    }
}

/// Keys may contain `/` (repository ids); keep them to one path segment.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' => '~',
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock with timeout.
///
/// Returns the locked file handle; the lock is released when it is dropped.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing to the state store.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock with timeout.
fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing to the state store.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on state store");
            }
        }
    }
}
