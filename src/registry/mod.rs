// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model registry access.
//!
//! Lists repository trees, reads file metadata and streams file content from a
//! hub-style registry (`/api/{kind}s/{ns}/{name}/tree/{rev}` and
//! `/{ns}/{name}/resolve/{rev}/{path}`).
//!
//! # Example
//!
//! ```rust,no_run
//! use modelfetch::ratelimit::{RateLimitConfig, RateLimiters};
//! use modelfetch::registry::{RegistryClient, Repository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let limiters = RateLimiters::in_memory(RateLimitConfig::authenticated(), RateLimitConfig::anonymous());
//! let client = RegistryClient::new(None, limiters)?;
//! let repo = Repository::model("TheBloke/Llama-2-7B-GGUF")?;
//!
//! for file in client.list_files(&repo, "main", Some("*.gguf"), None).await? {
//!     println!("{} ({} bytes)", file.path, file.size);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod types;

pub use client::{plan_against_cache, RegistryClient};
pub use types::{
    FileInfo, FileMetadata, LfsPointer, RepoKind, Repository, SnapshotPlan, DEFAULT_ENDPOINT,
};
