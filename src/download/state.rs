// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence for download records.
//!
//! Records live in the `downloads` collection of a [`JsonStore`], one file
//! per download, so concurrent processes only contend on the store lock.
//! The process driving a download holds a [`Lease`] on it; a record whose
//! lease is held belongs to a live process even when it looks abandoned.

use anyhow::Result;

use super::types::PersistedDownload;
use crate::store::{JsonStore, Lease};

const COLLECTION: &str = "downloads";

/// Store of [`PersistedDownload`] records.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    store: JsonStore,
}

impl DownloadStore {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    pub fn save(&self, download: &PersistedDownload) -> Result<()> {
        self.store.save(COLLECTION, &download.id, download)
    }

    pub fn load(&self, id: &str) -> Result<Option<PersistedDownload>> {
        self.store.load(COLLECTION, id)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.store.remove(COLLECTION, id)
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<PersistedDownload>> {
        let mut downloads: Vec<PersistedDownload> = self.store.load_all(COLLECTION)?;
        downloads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(downloads)
    }

    /// Records that can still make progress.
    pub fn resumable(&self) -> Result<Vec<PersistedDownload>> {
        Ok(self.list()?.into_iter().filter(|d| !d.state.is_terminal()).collect())
    }

    pub async fn save_async(&self, download: &PersistedDownload) -> Result<()> {
        self.store.save_async(COLLECTION, &download.id, download).await
    }

    pub async fn load_async(&self, id: &str) -> Result<Option<PersistedDownload>> {
        self.store.load_async(COLLECTION, id).await
    }

    /// Delete the record and its lease file.
    pub async fn remove_async(&self, id: &str) -> Result<()> {
        self.store.remove_async(COLLECTION, id).await?;
        self.store.remove_lease_file(COLLECTION, id);
        Ok(())
    }

    /// [`resumable`](Self::resumable) off the async runtime's worker threads.
    pub async fn resumable_async(&self) -> Result<Vec<PersistedDownload>> {
        let mut downloads: Vec<PersistedDownload> = self.store.load_all_async(COLLECTION).await?;
        downloads.retain(|d| !d.state.is_terminal());
        downloads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(downloads)
    }

    /// Claim the right to drive download `id`. `Ok(None)` when a live
    /// process already drives it.
    pub fn claim(&self, id: &str) -> Result<Option<Lease>> {
        self.store.try_lease(COLLECTION, id)
    }

    /// Whether a live process is driving download `id`.
    pub fn is_claimed(&self, id: &str) -> Result<bool> {
        self.store.is_leased(COLLECTION, id)
    }

    /// Save, logging instead of failing. Used on paths where the in-memory
    /// state is authoritative and a failed write only loses crash recovery.
    pub async fn save_logged_async(&self, download: &PersistedDownload) {
        if let Err(e) = self.save_async(download).await {
            tracing::error!(id = %download.id, "Failed to save download record: {:#}", e);
        }
    }
}
