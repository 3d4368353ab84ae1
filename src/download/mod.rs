// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background download system.
//!
//! This module provides non-blocking repository downloads with:
//! - Progress visibility through [`DownloadHandle`] and `modelfetch status`
//! - Byte-range resume that survives restarts
//! - Disk-space checks, retries with backoff and SHA-256 verification
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐     ┌─────────────────┐
//! │ BackgroundDownloadManager│────▶│ tokio task per  │
//! │                          │     │ download        │
//! └────────────┬─────────────┘     └────────┬────────┘
//!              │                            │
//!              ▼                            ▼
//! ┌──────────────────────────┐     ┌─────────────────┐
//! │ DownloadStore            │     │ DownloadPipeline│
//! │ (persistent records)     │     │ (.part + Range) │
//! └──────────────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use modelfetch::download::{BackgroundDownloadManager, DownloadPipeline, DownloadRequest, DownloadStore, PipelineOptions};
//! use modelfetch::ratelimit::{RateLimitConfig, RateLimiters};
//! use modelfetch::registry::{RegistryClient, Repository};
//! use modelfetch::store::JsonStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let limiters = RateLimiters::in_memory(RateLimitConfig::authenticated(), RateLimitConfig::anonymous());
//! let client = RegistryClient::new(None, limiters)?;
//! let pipeline = DownloadPipeline::new(client, PipelineOptions::default());
//! let store = DownloadStore::new(JsonStore::open(JsonStore::default_location())?);
//! let manager = BackgroundDownloadManager::builder(pipeline, store).build();
//!
//! let repo = Repository::model("TheBloke/Mistral-7B-Instruct-v0.2-GGUF")?;
//! let mut handle = manager.start(DownloadRequest::new(repo)).await?;
//! let last = handle.wait().await;
//! println!("{}: {}", last.repository, last.state);
//! # Ok(())
//! # }
//! ```

pub mod manager;
pub mod pipeline;
pub mod state;
pub mod throttle;
pub mod types;

pub use manager::{BackgroundDownloadManager, DownloadHandle, DownloadRequest, DownloadSnapshot, ManagerBuilder};
pub use pipeline::{
    part_path, remove_partials, sha256_file, DownloadPipeline, LocalVolume, PipelineOptions, SpaceChecker,
    VolumeInfo, PART_SUFFIX,
};
pub use state::DownloadStore;
pub use throttle::{ProgressThrottle, DEFAULT_THROTTLE_INTERVAL};
pub use types::{
    DownloadProgress, DownloadState, FileDownloadDescriptor, InvalidTransition, PersistedDownload, ProgressEvent,
};
