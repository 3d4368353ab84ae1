// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager for background repository downloading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pipeline::{remove_partials, DownloadPipeline};
use super::state::DownloadStore;
use super::throttle::{ProgressThrottle, DEFAULT_THROTTLE_INTERVAL};
use super::types::{
    DownloadProgress, DownloadState, FileDownloadDescriptor, PersistedDownload, ProgressEvent,
};
use crate::collaborators::{
    ModelRecord, ModelStateCommand, ModelStateReporter, NoopModelState, NotificationKind,
    NotificationSink, TracingNotifier,
};
use crate::config::Config;
use crate::error::{hub_error, HubError};
use crate::memory::{
    check_compatibility, estimate_from_file_size, DeviceCompatibility, DeviceMemoryInfo,
    DEFAULT_OVERHEAD_FRACTION,
};
use crate::registry::Repository;
use crate::select::Backend;
use crate::store::Lease;
use crate::sync::{resilient_read, resilient_write};
use crate::utils::{format_bytes, random_id};

/// What to download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub repository: Repository,
    pub revision: String,
    /// Packaging format; detected from the listing when `None`
    pub backend: Option<Backend>,
    /// Substring of one file name to fetch instead of the automatic choice
    pub filename: Option<String>,
    /// Glob patterns applied to the listing before selection
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Target directory (default: `<cache_dir>/<namespace>/<name>`)
    pub destination: Option<PathBuf>,
}

impl DownloadRequest {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            revision: "main".to_string(),
            backend: None,
            filename: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            destination: None,
        }
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Point-in-time view of a download, published to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSnapshot {
    pub id: String,
    pub repository: String,
    pub state: DownloadState,
    pub progress: DownloadProgress,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl DownloadSnapshot {
    fn of(record: &PersistedDownload, current_file: Option<String>) -> Self {
        let mut progress = record.progress();
        progress.current_file = current_file;
        Self {
            id: record.id.clone(),
            repository: record.repository.clone(),
            state: record.state,
            progress,
            error: record.error.clone(),
            warnings: record.warnings.clone(),
        }
    }
}

/// Handle to a download, allowing status checks.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub id: String,
    rx: watch::Receiver<DownloadSnapshot>,
}

impl DownloadHandle {
    /// Get the current snapshot.
    pub fn progress(&self) -> DownloadSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. Returns `None` once the manager
    /// stops publishing for this download.
    pub async fn changed(&mut self) -> Option<DownloadSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the download stops running (completed, failed, paused or
    /// cancelled) and return its last snapshot.
    pub async fn wait(&mut self) -> DownloadSnapshot {
        loop {
            {
                let snapshot = self.rx.borrow_and_update();
                if !snapshot.state.is_active() {
                    return snapshot.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

struct ActiveDownload {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

/// Configures a [`BackgroundDownloadManager`].
pub struct ManagerBuilder {
    pipeline: DownloadPipeline,
    store: DownloadStore,
    cache_dir: PathBuf,
    notifier: Arc<dyn NotificationSink>,
    model_state: Arc<dyn ModelStateReporter>,
    device: Option<DeviceMemoryInfo>,
    throttle_interval: Duration,
    overhead_fraction: f64,
}

impl ManagerBuilder {
    pub fn new(pipeline: DownloadPipeline, store: DownloadStore) -> Self {
        Self {
            pipeline,
            store,
            cache_dir: crate::config::app_dir().join("models"),
            notifier: Arc::new(TracingNotifier),
            model_state: Arc::new(NoopModelState),
            device: None,
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            overhead_fraction: DEFAULT_OVERHEAD_FRACTION,
        }
    }

    /// Take cache directory, throttle interval and overhead from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.cache_dir = config.cache_dir();
        self.throttle_interval = config.progress_throttle();
        self.overhead_fraction = config.overhead_fraction;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn model_state(mut self, model_state: Arc<dyn ModelStateReporter>) -> Self {
        self.model_state = model_state;
        self
    }

    /// Fixed device memory figures instead of a live reading.
    pub fn device(mut self, device: DeviceMemoryInfo) -> Self {
        self.device = Some(device);
        self
    }

    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn overhead_fraction(mut self, fraction: f64) -> Self {
        self.overhead_fraction = fraction;
        self
    }

    pub fn build(self) -> BackgroundDownloadManager {
        let session_id = random_id(16);
        tracing::debug!(session = %session_id, cache = %self.cache_dir.display(), "Download manager ready");
        BackgroundDownloadManager {
            inner: Arc::new(Inner {
                pipeline: self.pipeline,
                store: self.store,
                cache_dir: self.cache_dir,
                notifier: self.notifier,
                model_state: self.model_state,
                device: self.device.unwrap_or_else(DeviceMemoryInfo::current),
                throttle_interval: self.throttle_interval,
                overhead_fraction: self.overhead_fraction,
                session_id,
                active: Mutex::new(HashMap::new()),
                watchers: RwLock::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

/// Manager for background downloads.
///
/// Runs each download as a tokio task and keeps a [`PersistedDownload`]
/// record current on disk, so a download interrupted by a crash or shutdown
/// can be found with [`restore`](Self::restore) and continued with
/// [`resume`](Self::resume).
#[derive(Clone)]
pub struct BackgroundDownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: DownloadPipeline,
    store: DownloadStore,
    cache_dir: PathBuf,
    notifier: Arc<dyn NotificationSink>,
    model_state: Arc<dyn ModelStateReporter>,
    device: DeviceMemoryInfo,
    throttle_interval: Duration,
    overhead_fraction: f64,
    session_id: String,
    /// Running tasks by download id
    active: Mutex<HashMap<String, ActiveDownload>>,
    /// Snapshot publishers by download id
    watchers: RwLock<HashMap<String, watch::Sender<DownloadSnapshot>>>,
    generation: AtomicU64,
}

impl BackgroundDownloadManager {
    pub fn builder(pipeline: DownloadPipeline, store: DownloadStore) -> ManagerBuilder {
        ManagerBuilder::new(pipeline, store)
    }

    /// Identifier of this process's manager, stamped on the records it drives.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn device(&self) -> &DeviceMemoryInfo {
        &self.inner.device
    }

    /// List the repository, select files for the backend and start
    /// downloading them in the background.
    ///
    /// Listing, selection and the memory check all happen before anything is
    /// recorded, so their errors leave no trace on disk.
    pub async fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        let inner = &self.inner;
        let repo = &request.repository;
        let files = inner
            .pipeline
            .client()
            .list_files_matching(repo, &request.revision, &request.includes, &request.excludes)
            .await?;
        if files.is_empty() {
            return Err(HubError::FileNotFound(format!(
                "{} has no matching files at revision {}",
                repo, request.revision
            ))
            .into());
        }

        let backend = match request.backend {
            Some(backend) => backend,
            None => Backend::detect(&files).ok_or_else(|| {
                HubError::UnsupportedFormat(format!("no GGUF, Core ML or safetensors files in {}", repo))
            })?,
        };
        let tier = inner.device.tier();
        let selection = backend
            .selector(tier, request.filename.as_deref())
            .select_files(&files)?;
        if selection.is_empty() {
            return Err(HubError::UnsupportedFormat(format!("no {} files in {}", backend, repo)).into());
        }

        let total_bytes = selection.total_bytes();
        let mut warnings = selection.warnings.clone();
        match estimate_from_file_size(total_bytes, inner.overhead_fraction) {
            Ok(requirements) => {
                let fit = check_compatibility(&requirements, &inner.device);
                tracing::info!(repo = %repo, needed = requirements.total_bytes, fit = %fit, "Memory check");
                if !matches!(
                    fit,
                    DeviceCompatibility::FullOffload { .. } | DeviceCompatibility::PartialOffload { .. }
                ) {
                    warnings.push(format!("{}: {}", repo, fit));
                }
            }
            Err(e) => tracing::warn!(repo = %repo, "Skipping memory check: {:#}", e),
        }

        let now = Utc::now();
        let record = PersistedDownload {
            id: format!("dl-{}", random_id(12)),
            repository: repo.id(),
            repo_kind: repo.kind(),
            endpoint: repo.endpoint().to_string(),
            revision: request.revision.clone(),
            backend,
            session_id: inner.session_id.clone(),
            destination: request
                .destination
                .clone()
                .unwrap_or_else(|| inner.cache_dir.join(repo.namespace()).join(repo.name())),
            files: selection.files.iter().map(FileDownloadDescriptor::from).collect(),
            bytes_downloaded: 0,
            total_bytes,
            state: DownloadState::Pending,
            error: None,
            warnings,
            created_at: now,
            updated_at: now,
        };
        inner.store.save_async(&record).await?;
        tracing::info!(
            id = %record.id,
            repo = %record.repository,
            backend = %backend,
            files = record.files.len(),
            size = %format_bytes(total_bytes),
            "Download queued"
        );
        for warning in &record.warnings {
            inner.notifier.notify(NotificationKind::Warning, warning);
        }

        self.spawn(record).await
    }

    /// Stop a running download, keeping its partial files.
    pub async fn pause(&self, id: &str) -> Result<DownloadSnapshot> {
        let entry = self.inner.active.lock().await.remove(id);
        let Some(entry) = entry else {
            bail!("Download {} is not running", id);
        };
        self.inner.stop_and_pause(id, entry).await
    }

    /// Continue a paused (or never started) download.
    pub async fn resume(&self, id: &str) -> Result<DownloadHandle> {
        let record = self.inner.load(id).await?;
        match record.state {
            DownloadState::Paused | DownloadState::Pending | DownloadState::Downloading => {}
            other => bail!("Cannot resume a {} download; start it again instead", other),
        }
        self.spawn(record).await
    }

    /// Stop a download and discard it with its partial files.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.inner.stop_here_or_refuse(id).await?;

        let mut record = self.inner.load(id).await?;
        if record.state.can_transition_to(DownloadState::Cancelled) {
            record.transition(DownloadState::Cancelled)?;
            self.inner.store.save_async(&record).await?;
        }
        self.inner.publish(&record, None);

        remove_partials(&record.pending_files(), &record.destination).await?;
        self.inner.store.remove_async(id).await?;
        resilient_write(&self.inner.watchers).remove(id);

        tracing::info!(id, repo = %record.repository, "Download cancelled");
        self.inner.notifier.notify(
            NotificationKind::DownloadCancelled,
            &format!("Cancelled download of {}", record.repository),
        );
        Ok(())
    }

    /// Cancel if running, then remove the record and every file it fetched.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.inner.stop_here_or_refuse(id).await?;

        let record = self.inner.load(id).await?;
        let files: Vec<_> = record.files.iter().map(FileDownloadDescriptor::to_file_info).collect();
        remove_partials(&files, &record.destination).await?;
        for file in &files {
            match file.local_path(&record.destination) {
                Ok(path) => remove_file_if_exists(&path).await?,
                Err(e) => tracing::warn!(id, "Not removing {}", e),
            }
        }
        // Only succeeds when nothing else lives there.
        let _ = tokio::fs::remove_dir(&record.destination).await;

        self.inner.store.remove_async(id).await?;
        resilient_write(&self.inner.watchers).remove(id);
        self.inner.model_state.write(ModelStateCommand::MarkRemoved {
            repository: record.repository.clone(),
        })?;
        tracing::info!(id, repo = %record.repository, "Download deleted");
        Ok(())
    }

    /// All persisted records, oldest first.
    pub fn list(&self) -> Result<Vec<PersistedDownload>> {
        self.inner.store.list()
    }

    /// Snapshots of downloads running in this process.
    pub async fn active_downloads(&self) -> Vec<DownloadSnapshot> {
        let ids: Vec<String> = self.inner.active.lock().await.keys().cloned().collect();
        let watchers = resilient_read(&self.inner.watchers);
        let mut snapshots: Vec<DownloadSnapshot> = ids
            .iter()
            .filter_map(|id| watchers.get(id).map(|tx| tx.borrow().clone()))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Latest snapshot for `id`, live if it is running here, else from its record.
    pub fn progress(&self, id: &str) -> Result<Option<DownloadSnapshot>> {
        if let Some(tx) = resilient_read(&self.inner.watchers).get(id) {
            return Ok(Some(tx.borrow().clone()));
        }
        Ok(self
            .inner
            .store
            .load(id)?
            .map(|record| DownloadSnapshot::of(&record, None)))
    }

    /// Subscribe to a download started in this process.
    pub fn handle(&self, id: &str) -> Option<DownloadHandle> {
        resilient_read(&self.inner.watchers).get(id).map(|tx| DownloadHandle {
            id: id.to_string(),
            rx: tx.subscribe(),
        })
    }

    /// Find downloads left unfinished by an earlier process.
    ///
    /// Records still marked downloading whose lease is free belonged to a
    /// process that died; they are marked paused. Records driven by a live
    /// process, this one or another, are left alone. Returns every record
    /// that can be resumed.
    pub async fn restore(&self) -> Result<Vec<PersistedDownload>> {
        let running: Vec<String> = self.inner.active.lock().await.keys().cloned().collect();
        let mut resumable = Vec::new();
        for mut record in self.inner.store.resumable_async().await? {
            if running.contains(&record.id) {
                continue;
            }
            if self.inner.store.is_claimed(&record.id)? {
                tracing::debug!(id = %record.id, session = %record.session_id, "Download is running in another process");
                continue;
            }
            if record.state == DownloadState::Downloading {
                record.transition(DownloadState::Paused)?;
                self.inner.store.save_async(&record).await?;
                tracing::info!(
                    id = %record.id,
                    repo = %record.repository,
                    previous_session = %record.session_id,
                    "Marked interrupted download as paused"
                );
            }
            resumable.push(record);
        }
        Ok(resumable)
    }

    /// Pause every running download. Called before the process exits.
    pub async fn shutdown(&self) -> Result<()> {
        let entries: Vec<(String, ActiveDownload)> = self.inner.active.lock().await.drain().collect();
        if entries.is_empty() {
            return Ok(());
        }
        tracing::info!(count = entries.len(), "Pausing downloads for shutdown");
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        for (id, entry) in entries {
            if let Err(e) = self.inner.stop_and_pause(&id, entry).await {
                tracing::error!(id = %id, "Failed to save state during shutdown: {:#}", e);
            }
        }
        Ok(())
    }

    async fn spawn(&self, mut record: PersistedDownload) -> Result<DownloadHandle> {
        let inner = &self.inner;
        let mut active = inner.active.lock().await;
        if active.contains_key(&record.id) {
            if let Some(handle) = self.handle(&record.id) {
                return Ok(handle);
            }
        }

        let lease = inner
            .store
            .claim(&record.id)?
            .ok_or_else(|| anyhow!("Download {} is running in another process", record.id))?;

        if record.state != DownloadState::Downloading {
            record.transition(DownloadState::Downloading)?;
        }
        record.session_id = inner.session_id.clone();
        record.error = None;
        inner.store.save_async(&record).await?;

        let snapshot = DownloadSnapshot::of(&record, None);
        let rx = {
            let mut watchers = resilient_write(&inner.watchers);
            match watchers.get(&record.id) {
                Some(tx) => {
                    tx.send_replace(snapshot);
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = watch::channel(snapshot);
                    watchers.insert(record.id.clone(), tx);
                    rx
                }
            }
        };

        let id = record.id.clone();
        let cancel = CancellationToken::new();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst);
        let task_inner = Arc::clone(inner);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            task_inner.drive(record, lease, task_cancel, generation).await;
        });
        active.insert(id.clone(), ActiveDownload { cancel, handle, generation });

        Ok(DownloadHandle { id, rx })
    }
}

/// Byte accounting for files in flight.
#[derive(Default)]
struct Tracker {
    in_flight: HashMap<String, u64>,
    current_file: Option<String>,
}

impl Inner {
    async fn load(&self, id: &str) -> Result<PersistedDownload> {
        self.store
            .load_async(id)
            .await?
            .with_context(|| format!("No download with id {}", id))
    }

    /// Stop the task for `id` if this process runs it. Fails when another
    /// live process drives the download.
    async fn stop_here_or_refuse(&self, id: &str) -> Result<()> {
        let entry = self.active.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                self.join(id, entry.handle).await;
            }
            None if self.store.is_claimed(id)? => {
                bail!("Download {} is running in another process", id);
            }
            None => {}
        }
        Ok(())
    }

    /// Runs one download to its end. `lease` is held for the whole run and
    /// released before the initiator of a stop records the final state.
    async fn drive(
        self: Arc<Self>,
        mut record: PersistedDownload,
        lease: Lease,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let id = record.id.clone();
        match self.run(&mut record, &cancel).await {
            Ok(()) => self.complete(&mut record).await,
            Err(e) if matches!(hub_error(&e), Some(HubError::Cancelled)) => {
                // Whoever cancelled decides the final state.
                tracing::debug!(id = %id, "Download task stopped");
                self.store.save_logged_async(&record).await;
            }
            Err(e) => self.fail(&mut record, &e).await,
        }
        drop(lease);
        self.release(&id, generation).await;
    }

    async fn run(&self, record: &mut PersistedDownload, cancel: &CancellationToken) -> Result<()> {
        let repo = Repository::parse(&record.repository, record.repo_kind, &record.endpoint)?;
        let pending = record.pending_files();
        let destination = record.destination.clone();
        let revision = record.revision.clone();
        tracing::info!(id = %record.id, repo = %repo, files = pending.len(), "Download started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = Tracker::default();
        let mut throttle = ProgressThrottle::new(self.throttle_interval);

        let transfer = self
            .pipeline
            .download_all(&repo, &revision, &pending, &destination, &tx, cancel);
        tokio::pin!(transfer);

        let result = loop {
            tokio::select! {
                result = &mut transfer => break result,
                Some(event) = rx.recv() => self.apply(record, &mut tracker, &mut throttle, event).await,
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.apply(record, &mut tracker, &mut throttle, event).await;
        }
        result.map(|_| ())
    }

    async fn apply(
        &self,
        record: &mut PersistedDownload,
        tracker: &mut Tracker,
        throttle: &mut ProgressThrottle,
        event: ProgressEvent,
    ) {
        let mut file_done = false;
        let mut restarted = false;
        match event {
            ProgressEvent::FileStarted { path, offset, .. } => {
                let before = tracker.in_flight.insert(path.clone(), offset).unwrap_or(0);
                restarted = offset < before;
                tracker.current_file = Some(path);
            }
            ProgressEvent::BytesWritten { path, bytes } => {
                *tracker.in_flight.entry(path).or_insert(0) += bytes;
            }
            ProgressEvent::FileCompleted { path, .. } | ProgressEvent::FileSkipped { path, .. } => {
                tracker.in_flight.remove(&path);
                file_done = record.mark_file_completed(&path);
            }
        }

        let completed: u64 = record.files.iter().filter(|f| f.completed).map(|f| f.size).sum();
        let in_flight: u64 = tracker.in_flight.values().sum();
        record.bytes_downloaded = completed.saturating_add(in_flight).min(record.total_bytes);

        if file_done {
            self.store.save_logged_async(record).await;
        }
        if restarted {
            // Progress went backwards; start throttling afresh from here.
            throttle.reset();
        }
        let snapshot = DownloadSnapshot::of(record, tracker.current_file.clone());
        if file_done || throttle.should_forward(snapshot.progress.fraction()) {
            self.send(&record.id, snapshot);
        }
    }

    async fn complete(&self, record: &mut PersistedDownload) {
        if let Err(e) = record.transition(DownloadState::Completed) {
            tracing::error!(id = %record.id, "{}", e);
            return;
        }
        record.bytes_downloaded = record.total_bytes;

        let model = ModelRecord {
            repository: record.repository.clone(),
            backend: record.backend,
            path: record.destination.clone(),
            files: record.files.iter().map(|f| f.path.clone()).collect(),
            completed_at: Utc::now(),
        };
        if let Err(e) = self.model_state.write(ModelStateCommand::MarkDownloaded(model)) {
            tracing::error!(id = %record.id, "Failed to report downloaded model: {:#}", e);
        }
        if let Err(e) = self.store.remove_async(&record.id).await {
            tracing::error!(id = %record.id, "Failed to remove finished download record: {:#}", e);
        }

        tracing::info!(id = %record.id, repo = %record.repository, "Download complete");
        self.notifier.notify(
            NotificationKind::DownloadCompleted,
            &format!(
                "Downloaded {} ({}) to {}",
                record.repository,
                format_bytes(record.total_bytes),
                record.destination.display()
            ),
        );
        // Watchers see the final state only after the bookkeeping above.
        self.publish(record, None);
    }

    async fn fail(&self, record: &mut PersistedDownload, err: &anyhow::Error) {
        let message = match hub_error(err) {
            Some(hub) => hub.to_string(),
            None => format!("{:#}", err),
        };
        tracing::error!(id = %record.id, repo = %record.repository, "Download failed: {:#}", err);
        record.error = Some(message.clone());
        if let Err(e) = record.transition(DownloadState::Failed) {
            tracing::error!(id = %record.id, "{}", e);
        }
        self.store.save_logged_async(record).await;
        self.notifier.notify(
            NotificationKind::DownloadFailed,
            &format!("Download of {} failed: {}", record.repository, message),
        );
        self.publish(record, None);
    }

    /// Cancel a task that was already taken out of the active set, wait for
    /// it, and record the download as paused.
    async fn stop_and_pause(&self, id: &str, entry: ActiveDownload) -> Result<DownloadSnapshot> {
        entry.cancel.cancel();
        self.join(id, entry.handle).await;

        let Some(mut record) = self.store.load_async(id).await? else {
            // Completed while stopping; the record is gone.
            return Ok(self.last_snapshot(id));
        };
        if record.state == DownloadState::Downloading {
            record.transition(DownloadState::Paused)?;
            self.store.save_async(&record).await?;
            tracing::info!(id, repo = %record.repository, "Download paused");
        }
        self.publish(&record, None);
        Ok(DownloadSnapshot::of(&record, None))
    }

    async fn join(&self, id: &str, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            tracing::warn!(id, "Download task ended abnormally: {}", e);
        }
    }

    /// Forget the active entry unless a newer task replaced it.
    async fn release(&self, id: &str, generation: u64) {
        let mut active = self.active.lock().await;
        if active.get(id).is_some_and(|entry| entry.generation == generation) {
            active.remove(id);
        }
    }

    fn publish(&self, record: &PersistedDownload, current_file: Option<String>) {
        self.send(&record.id, DownloadSnapshot::of(record, current_file));
    }

    fn send(&self, id: &str, snapshot: DownloadSnapshot) {
        if let Some(tx) = resilient_read(&self.watchers).get(id) {
            tx.send_replace(snapshot);
        }
    }

    fn last_snapshot(&self, id: &str) -> DownloadSnapshot {
        match resilient_read(&self.watchers).get(id) {
            Some(tx) => tx.borrow().clone(),
            None => DownloadSnapshot {
                id: id.to_string(),
                repository: String::new(),
                state: DownloadState::Completed,
                progress: DownloadProgress::default(),
                error: None,
                warnings: Vec::new(),
            },
        }
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}
