// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for background repository downloading.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{FileInfo, RepoKind};
use crate::select::Backend;

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Recorded, not started yet
    Pending,
    /// Transferring files
    Downloading,
    /// Stopped by the user or by shutdown; partial files are kept
    Paused,
    /// Every file transferred and verified
    Completed,
    /// Gave up after a permanent error or exhausted retries
    Failed,
    /// Stopped by the user; partial files are removed
    Cancelled,
}

impl DownloadState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled)
    }

    /// Returns true if the download is actively running.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Pending | DownloadState::Downloading)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::Pending => "pending",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Snapshot of an in-flight download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub files_completed: usize,
    pub total_files: usize,
    pub current_file: Option<String>,
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.total_files > 0 && self.files_completed >= self.total_files { 1.0 } else { 0.0 };
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    /// Get progress percentage (0-100).
    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// Per-file record kept so a restarted process can skip verified files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadDescriptor {
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

impl From<&FileInfo> for FileDownloadDescriptor {
    fn from(file: &FileInfo) -> Self {
        Self {
            path: file.path.clone(),
            size: file.size,
            sha256: file.sha256().map(String::from),
            completed: false,
        }
    }
}

impl FileDownloadDescriptor {
    /// Back to a listing entry, for handing to the pipeline.
    pub fn to_file_info(&self) -> FileInfo {
        let mut file = FileInfo::new(self.path.clone(), self.size);
        if let Some(oid) = &self.sha256 {
            file.lfs = Some(crate::registry::LfsPointer {
                oid: oid.clone(),
                size: self.size,
                pointer_size: 0,
            });
        }
        file
    }
}

/// Durable download record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDownload {
    /// Unique identifier
    pub id: String,
    /// `namespace/name`
    pub repository: String,
    #[serde(default)]
    pub repo_kind: RepoKind,
    pub endpoint: String,
    pub revision: String,
    pub backend: Backend,
    /// Process session that last drove this download
    pub session_id: String,
    pub destination: PathBuf,
    pub files: Vec<FileDownloadDescriptor>,
    #[serde(default)]
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub state: DownloadState,
    #[serde(default)]
    pub error: Option<String>,
    /// Selection warnings, e.g. a quantization fallback
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedDownload {
    /// Expected file paths, in listing order.
    pub fn expected_files(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    /// Paths already transferred and verified.
    pub fn completed_files(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| f.completed)
            .map(|f| f.path.as_str())
            .collect()
    }

    /// Files still to transfer.
    pub fn pending_files(&self) -> Vec<FileInfo> {
        self.files
            .iter()
            .filter(|f| !f.completed)
            .map(FileDownloadDescriptor::to_file_info)
            .collect()
    }

    pub fn mark_file_completed(&mut self, path: &str) -> bool {
        match self.files.iter_mut().find(|f| f.path == path) {
            Some(file) if !file.completed => {
                file.completed = true;
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: DownloadState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Progress derived from the record.
    pub fn progress(&self) -> DownloadProgress {
        DownloadProgress {
            bytes_downloaded: self.bytes_downloaded.min(self.total_bytes),
            total_bytes: self.total_bytes,
            files_completed: self.files.iter().filter(|f| f.completed).count(),
            total_files: self.files.len(),
            current_file: None,
        }
    }
}

/// A forbidden state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: DownloadState,
    pub to: DownloadState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move a {} download to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Events emitted by the pipeline while transferring files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A transfer attempt began at `offset` bytes into the file.
    FileStarted { path: String, size: u64, offset: u64 },
    /// `bytes` more bytes were written to the file.
    BytesWritten { path: String, bytes: u64 },
    /// The file was verified and moved into place.
    FileCompleted { path: String, size: u64 },
    /// The file was already present with the expected size.
    FileSkipped { path: String, size: u64 },
}
