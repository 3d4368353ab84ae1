// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable, verified file transfers.
//!
//! Each file streams into `<dest>.part`. A later attempt (or a later process)
//! continues from the bytes already on disk with `Range: bytes=<n>-`. The part
//! file only replaces the destination once its size, and its SHA-256 when the
//! listing carries one, check out.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs::{self as afs, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::types::ProgressEvent;
use crate::config::{Config, MAX_WORKERS, MIN_WORKERS};
use crate::error::{hub_error, HubError};
use crate::registry::{FileInfo, RegistryClient, Repository};
use crate::retry::RetryPolicy;

/// Suffix of in-progress files.
pub const PART_SUFFIX: &str = ".part";

/// Read buffer for hashing (8 MB).
const HASH_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Free-space lookup for a destination path.
pub trait VolumeInfo: Send + Sync {
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Volume information from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalVolume;

impl VolumeInfo for LocalVolume {
    fn available_space(&self, path: &Path) -> Result<u64> {
        // The destination may not exist yet; ask about its nearest ancestor.
        let existing = path
            .ancestors()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(existing)
            .with_context(|| format!("Failed to query free space for {:?}", existing))
    }
}

/// Compares a download size, scaled by a safety multiplier, against free space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceChecker {
    multiplier: f64,
}

impl SpaceChecker {
    pub fn new(multiplier: f64) -> Self {
        Self {
            multiplier: if multiplier.is_finite() { multiplier.max(0.0) } else { 1.0 },
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn required_space(&self, size: u64) -> u64 {
        (size as f64 * self.multiplier).ceil() as u64
    }

    pub fn has_enough_space(&self, size: u64, free: u64) -> bool {
        self.required_space(size) <= free
    }

    /// Fail with [`HubError::InsufficientSpace`] when `size` does not fit at `dest`.
    pub fn check(&self, size: u64, dest: &Path, volume: &dyn VolumeInfo) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let available = volume.available_space(dest)?;
        let required = self.required_space(size);
        if required > available {
            tracing::warn!(required, available, dest = %dest.display(), "Not enough disk space");
            return Err(HubError::InsufficientSpace { required, available }.into());
        }
        Ok(())
    }
}

impl Default for SpaceChecker {
    fn default() -> Self {
        Self::new(1.2)
    }
}

/// Tunables for a [`DownloadPipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    /// Concurrent file transfers, clamped to 1..=8
    pub workers: usize,
    /// Longest wait for the next chunk of a response body
    pub chunk_timeout: Duration,
    pub space_multiplier: f64,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            chunk_timeout: Duration::from_secs(60),
            space_multiplier: 1.2,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.effective_workers(),
            chunk_timeout: config.chunk_timeout(),
            space_multiplier: config.space_multiplier,
            retry: config.retry.policy(),
        }
    }
}

/// Fetches repository files to a local directory.
#[derive(Clone)]
pub struct DownloadPipeline {
    client: RegistryClient,
    options: PipelineOptions,
    space: SpaceChecker,
    volume: Arc<dyn VolumeInfo>,
}

impl DownloadPipeline {
    pub fn new(client: RegistryClient, options: PipelineOptions) -> Self {
        Self {
            client,
            space: SpaceChecker::new(options.space_multiplier),
            options,
            volume: Arc::new(LocalVolume),
        }
    }

    /// Use a different free-space source.
    pub fn with_volume(mut self, volume: Arc<dyn VolumeInfo>) -> Self {
        self.volume = volume;
        self
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Download `files` into `dest_dir` with a bounded pool of workers.
    ///
    /// Checks free space for the bytes still missing first. The first file
    /// that fails for good aborts the rest; their part files stay for a
    /// later resume.
    pub async fn download_all(
        &self,
        repo: &Repository,
        revision: &str,
        files: &[FileInfo],
        dest_dir: &Path,
        events: &UnboundedSender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let missing = remaining_bytes(files, dest_dir).await;
        self.space.check(missing, dest_dir, self.volume.as_ref())?;

        let workers = self.options.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        tracing::info!(repo = %repo, files = files.len(), missing, workers, "Starting transfers");

        // Owned per-file futures, so the stream borrows nothing from its items.
        let transfers = files.iter().cloned().map(|file| {
            let pipeline = self.clone();
            let repo = repo.clone();
            let revision = revision.to_string();
            let dest_dir = dest_dir.to_path_buf();
            let events = events.clone();
            let cancel = cancel.clone();
            async move {
                pipeline
                    .download_file(&repo, &revision, &file, &dest_dir, &events, &cancel)
                    .await
            }
        });
        let mut transfers = stream::iter(transfers).buffer_unordered(workers);

        let mut paths = Vec::with_capacity(files.len());
        while let Some(result) = transfers.next().await {
            paths.push(result?);
        }
        Ok(paths)
    }

    /// Download one file into `dest_dir`, retrying transient failures.
    ///
    /// A file already present with the listed size is skipped.
    pub async fn download_file(
        &self,
        repo: &Repository,
        revision: &str,
        file: &FileInfo,
        dest_dir: &Path,
        events: &UnboundedSender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = file.local_path(dest_dir)?;
        if is_complete(&dest, file.size).await {
            tracing::debug!(path = %file.path, "Already downloaded, skipping");
            let _ = events.send(ProgressEvent::FileSkipped {
                path: file.path.clone(),
                size: file.size,
            });
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            afs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let dest = dest.as_path();
        self.options
            .retry
            .run(cancel, move |attempt| async move {
                if attempt > 1 {
                    tracing::info!(path = %file.path, attempt, "Retrying transfer");
                }
                self.download_resume(repo, revision, file, dest, events, cancel).await
            })
            .await
    }

    /// One transfer attempt, continuing from `<dest>.part` when it exists.
    ///
    /// A 200 reply to a ranged request restarts the file from zero; a 416
    /// reply with a part file at least as large as the listing finalises it.
    pub async fn download_resume(
        &self,
        repo: &Repository,
        revision: &str,
        file: &FileInfo,
        dest: &Path,
        events: &UnboundedSender<ProgressEvent>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let part = part_path(dest);
        let mut offset = afs::metadata(&part).await.map(|m| m.len()).unwrap_or(0);
        if offset > file.size {
            tracing::warn!(path = %file.path, offset, size = file.size, "Part file larger than listing, restarting");
            remove_if_exists(&part).await?;
            offset = 0;
        }

        let response = match self.client.fetch(repo, &file.path, revision, Some(offset)).await {
            Ok(response) => response,
            Err(e) if is_range_not_satisfiable(&e) => {
                if offset >= file.size {
                    return self.finalize(file, &part, dest, events).await;
                }
                remove_if_exists(&part).await?;
                return Err(HubError::IncompleteTransfer {
                    path: file.path.clone(),
                    expected: file.size,
                    actual: offset,
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        let start = if response.status() == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            if offset > 0 {
                tracing::debug!(path = %file.path, offset, "Range ignored by server, restarting file");
            }
            0
        };

        let mut out = if start > 0 {
            OpenOptions::new().append(true).open(&part).await
        } else {
            afs::File::create(&part).await
        }
        .with_context(|| format!("Failed to open part file: {:?}", part))?;

        let _ = events.send(ProgressEvent::FileStarted {
            path: file.path.clone(),
            size: file.size,
            offset: start,
        });

        let chunk_timeout = self.options.chunk_timeout;
        let mut body = response.bytes_stream();
        let streamed: Result<()> = async {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(HubError::Cancelled.into()),
                    next = tokio::time::timeout(chunk_timeout, body.next()) => next,
                };
                let chunk = match next {
                    Err(_) => {
                        return Err(HubError::Timeout(format!(
                            "no data for {}s while downloading {}",
                            chunk_timeout.as_secs(),
                            file.path
                        ))
                        .into())
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(Err(e))) => return Err(HubError::Network(format!("{} ({})", file.path, e)).into()),
                    Ok(Some(Ok(chunk))) => chunk,
                };
                out.write_all(&chunk)
                    .await
                    .with_context(|| format!("Failed to write {:?}", part))?;
                let _ = events.send(ProgressEvent::BytesWritten {
                    path: file.path.clone(),
                    bytes: chunk.len() as u64,
                });
            }
        }
        .await;

        // Whatever arrived stays on disk for the next attempt.
        out.flush()
            .await
            .with_context(|| format!("Failed to flush {:?}", part))?;
        drop(out);
        streamed?;

        self.finalize(file, &part, dest, events).await
    }

    /// Verify a part file and move it into place.
    async fn finalize(
        &self,
        file: &FileInfo,
        part: &Path,
        dest: &Path,
        events: &UnboundedSender<ProgressEvent>,
    ) -> Result<PathBuf> {
        let actual = afs::metadata(part).await.map(|m| m.len()).unwrap_or(0);
        if actual != file.size {
            if actual > file.size {
                remove_if_exists(part).await?;
            }
            return Err(HubError::IncompleteTransfer {
                path: file.path.clone(),
                expected: file.size,
                actual,
            }
            .into());
        }

        if let Some(expected) = file.sha256() {
            let to_hash = part.to_path_buf();
            let digest = tokio::task::spawn_blocking(move || sha256_file(&to_hash))
                .await
                .context("Hashing task failed")??;
            if !digest.eq_ignore_ascii_case(expected) {
                remove_if_exists(part).await?;
                return Err(HubError::ChecksumMismatch {
                    path: file.path.clone(),
                    expected: expected.to_string(),
                    actual: digest,
                }
                .into());
            }
        }

        afs::rename(part, dest)
            .await
            .with_context(|| format!("Failed to move {:?} into place", part))?;
        tracing::debug!(path = %file.path, size = file.size, "File complete");
        let _ = events.send(ProgressEvent::FileCompleted {
            path: file.path.clone(),
            size: file.size,
        });
        Ok(dest.to_path_buf())
    }
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Bytes of `files` not yet on disk under `dest_dir`, counting part files.
pub async fn remaining_bytes(files: &[FileInfo], dest_dir: &Path) -> u64 {
    let mut missing = 0u64;
    for file in files {
        // Unsafe paths are refused by `download_file`; nothing lands for them.
        let Ok(dest) = file.local_path(dest_dir) else {
            continue;
        };
        if is_complete(&dest, file.size).await {
            continue;
        }
        let partial = afs::metadata(part_path(&dest))
            .await
            .map(|m| m.len())
            .unwrap_or(0)
            .min(file.size);
        missing = missing.saturating_add(file.size - partial);
    }
    missing
}

/// Delete the part files of `files` under `dest_dir`.
pub async fn remove_partials(files: &[FileInfo], dest_dir: &Path) -> Result<()> {
    for file in files {
        if let Ok(dest) = file.local_path(dest_dir) {
            remove_if_exists(&part_path(&dest)).await?;
        }
    }
    Ok(())
}

async fn is_complete(path: &Path, size: u64) -> bool {
    afs::metadata(path)
        .await
        .map(|m| m.is_file() && m.len() == size)
        .unwrap_or(false)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match afs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

fn is_range_not_satisfiable(err: &anyhow::Error) -> bool {
    matches!(hub_error(err), Some(HubError::Http { status: 416, .. }))
}

/// Hex SHA-256 of a file, read in 8 MB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).with_context(|| format!("Cannot open {:?} for hashing", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Read error while hashing {:?}", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateLimitConfig, RateLimiters};
    use crate::registry::RepoKind;
    use std::io::Write as _;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct FixedVolume(u64);

    impl VolumeInfo for FixedVolume {
        fn available_space(&self, _path: &Path) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn client() -> RegistryClient {
        let cfg = RateLimitConfig { requests_per_minute: 6000, burst_size: 100 };
        RegistryClient::new(None, RateLimiters::in_memory(cfg, cfg)).unwrap()
    }

    fn pipeline() -> DownloadPipeline {
        let options = PipelineOptions {
            retry: RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(20)),
            chunk_timeout: Duration::from_secs(5),
            ..PipelineOptions::default()
        };
        DownloadPipeline::new(client(), options).with_volume(Arc::new(FixedVolume(u64::MAX)))
    }

    fn repo(endpoint: &str) -> Repository {
        Repository::parse("org/model", RepoKind::Model, endpoint).unwrap()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn with_digest(path: &str, data: &[u8]) -> FileInfo {
        let mut file = FileInfo::new(path, data.len() as u64);
        file.lfs = Some(crate::registry::LfsPointer {
            oid: sha256_hex(data),
            size: data.len() as u64,
            pointer_size: 130,
        });
        file
    }

    #[test]
    fn test_has_enough_space() {
        let checker = SpaceChecker::new(1.5);
        assert!(checker.has_enough_space(100, 150));
        assert!(!checker.has_enough_space(100, 149));
        assert!(checker.has_enough_space(0, 0));
        assert_eq!(SpaceChecker::default().required_space(1000), 1200);
    }

    #[test]
    fn test_check_reports_need_and_have() {
        let err = SpaceChecker::new(1.2)
            .check(1000, Path::new("/tmp"), &FixedVolume(1100))
            .unwrap_err();
        assert_eq!(
            hub_error(&err),
            Some(&HubError::InsufficientSpace { required: 1200, available: 1100 })
        );
    }

    #[test]
    fn test_part_path() {
        assert_eq!(part_path(Path::new("/m/model.gguf")), PathBuf::from("/m/model.gguf.part"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_download_file_verifies_and_renames() {
        let mut server = mockito::Server::new_async().await;
        let body = b"weights-weights-weights".to_vec();
        let _mock = server
            .mock("GET", "/org/model/resolve/main/sub/model.bin")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let file = with_digest("sub/model.bin", &body);

        let path = pipeline()
            .download_file(&repo(&server.url()), "main", &file, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!part_path(&path).exists());

        let mut written = 0;
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::BytesWritten { bytes, .. } => written += bytes,
                ProgressEvent::FileCompleted { .. } => completed = true,
                _ => {}
            }
        }
        assert_eq!(written, body.len() as u64);
        assert!(completed);
    }

    #[tokio::test]
    async fn test_existing_file_skipped_without_request() {
        let server = mockito::Server::new_async().await;
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("model.bin"), vec![7u8; 16]).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let file = FileInfo::new("model.bin", 16);
        pipeline()
            .download_file(&repo(&server.url()), "main", &file, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::FileSkipped { path: "model.bin".into(), size: 16 }
        );
    }

    #[tokio::test]
    async fn test_resume_appends_after_partial() {
        let mut server = mockito::Server::new_async().await;
        let body: Vec<u8> = (0..100u8).collect();
        let mock = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .match_header("range", "bytes=40-")
            .with_status(206)
            .with_body(body[40..].to_vec())
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("model.bin.part"), &body[..40]).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let file = with_digest("model.bin", &body);
        let path = pipeline()
            .download_file(&repo(&server.url()), "main", &file, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_dropped_body_resumed_with_range_in_same_run() {
        let mut server = mockito::Server::new_async().await;
        let body: Vec<u8> = (0..100u8).collect();
        let head = body[..40].to_vec();
        let dropped = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .match_header("range", mockito::Matcher::Missing)
            .with_status(200)
            .with_chunked_body(move |w| {
                w.write_all(&head)?;
                std::thread::sleep(Duration::from_millis(100));
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection dropped"))
            })
            .expect(1)
            .create_async()
            .await;
        let resumed = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .match_header("range", "bytes=40-")
            .with_status(206)
            .with_body(body[40..].to_vec())
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let file = with_digest("model.bin", &body);
        let path = pipeline()
            .download_file(&repo(&server.url()), "main", &file, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        dropped.assert_async().await;
        resumed.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!dir.path().join("model.bin.part").exists());

        drop(tx);
        let mut offsets = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::FileStarted { offset, .. } = event {
                offsets.push(offset);
            }
        }
        assert_eq!(offsets, vec![0, 40]);
    }

    #[tokio::test]
    async fn test_full_reply_to_range_restarts() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![3u8; 64];
        let _mock = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("model.bin.part"), vec![9u8; 20]).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let path = pipeline()
            .download_file(
                &repo(&server.url()),
                "main",
                &FileInfo::new("model.bin", 64),
                dir.path(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_finalises_complete_part() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .match_header("range", "bytes=32-")
            .with_status(416)
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("model.bin.part"), vec![1u8; 32]).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let path = pipeline()
            .download_file(
                &repo(&server.url()),
                "main",
                &FileInfo::new("model.bin", 32),
                dir.path(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .with_status(200)
            .with_body(b"tampered".to_vec())
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let file = with_digest("model.bin", b"original");

        let err = pipeline()
            .download_file(&repo(&server.url()), "main", &file, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(hub_error(&err), Some(HubError::ChecksumMismatch { .. })));
        assert!(!dir.path().join("model.bin").exists());
        assert!(!dir.path().join("model.bin.part").exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_retried_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/org/model/resolve/main/model.bin")
            .with_status(200)
            .with_body(vec![5u8; 10])
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        pipeline()
            .download_file(
                &repo(&server.url()),
                "main",
                &FileInfo::new("model.bin", 10),
                dir.path(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_fails_fast() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/model/resolve/main/missing.bin")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipeline()
            .download_file(
                &repo(&server.url()),
                "main",
                &FileInfo::new("missing.bin", 10),
                dir.path(),
                &tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(hub_error(&err), Some(HubError::NotFound(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_all_checks_space_first() {
        let server = mockito::Server::new_async().await;
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let pipeline = DownloadPipeline::new(client(), PipelineOptions::default())
            .with_volume(Arc::new(FixedVolume(100)));

        let files = vec![FileInfo::new("a.bin", 60), FileInfo::new("b.bin", 40)];
        let err = pipeline
            .download_all(&repo(&server.url()), "main", &files, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            hub_error(&err),
            Some(&HubError::InsufficientSpace { required: 120, available: 100 })
        );
    }

    #[tokio::test]
    async fn test_download_all_fetches_every_file() {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
            mocks.push(
                server
                    .mock("GET", format!("/org/model/resolve/main/{}", name).as_str())
                    .with_body(name.repeat(4))
                    .create_async()
                    .await,
            );
        }

        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let files: Vec<FileInfo> = ["a.bin", "b.bin", "c.bin", "d.bin"]
            .iter()
            .map(|n| FileInfo::new(*n, 20))
            .collect();

        let mut paths = pipeline()
            .download_all(&repo(&server.url()), "main", &files, dir.path(), &tx, &CancellationToken::new())
            .await
            .unwrap();
        paths.sort();
        assert_eq!(paths.len(), 4);
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "a.bin".repeat(4));
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_path_outside_destination_refused() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(b"owned".to_vec())
            .expect(0)
            .create_async()
            .await;

        let root = TempDir::new().expect("Failed to create temp dir");
        let dest = root.path().join("models/org/model");
        let (tx, _rx) = mpsc::unbounded_channel();
        let file = FileInfo::new("../../escaped.safetensors", 5);

        let err = pipeline()
            .download_file(&repo(&server.url()), "main", &file, &dest, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            hub_error(&err),
            Some(&HubError::InvalidPath("../../escaped.safetensors".into()))
        );
        assert!(!root.path().join("models/escaped.safetensors").exists());
        assert!(!root.path().join("models/escaped.safetensors.part").exists());
        mock.assert_async().await;

        // Skipped by the space estimate and partial cleanup as well.
        assert_eq!(remaining_bytes(&[file.clone()], &dest).await, 0);
        remove_partials(&[file], &dest).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = mockito::Server::new_async().await;
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline()
            .download_file(&repo(&server.url()), "main", &FileInfo::new("x.bin", 4), dir.path(), &tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(hub_error(&err), Some(&HubError::Cancelled));
    }
}
