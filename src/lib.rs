// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelfetch - model downloads that fit the device
//!
//! Lists a model repository on a hub, picks the files a local runtime needs,
//! checks that the model fits in memory and downloads it with resume,
//! retries and rate limiting:
//!
//! **Listing** -> **Selection** -> **Memory check** -> **Resumable download**
//!
//! # Core Modules
//!
//! - [`registry`] - Hub client: file listings, metadata, ranged content
//! - [`select`] - GGUF, Core ML and safetensors file selection
//! - [`memory`] - Memory requirements and device compatibility
//! - [`ratelimit`] - Token-bucket limiter persisted across restarts
//! - [`retry`] - Exponential backoff and error classification
//! - [`download`] - Transfer pipeline and background download manager
//! - [`store`] - File-backed JSON state with locking
//! - [`credentials`] - Token sources and secret storage
//! - [`collaborators`] - Notification and model-state contracts
//! - [`config`] - User configuration
//! - [`error`] - Error taxonomy and consistent error formatting

pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod download;
pub mod error;
pub mod memory;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod select;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use registry::{FileInfo, RegistryClient, RepoKind, Repository};
pub use select::{Backend, FileSelector, Selection};
pub use select::quant::{detect_quantization, QuantizationLevel};

pub use memory::{
    calculate_memory_requirements, check_compatibility, estimate_from_file_size,
    DeviceCompatibility, DeviceMemoryInfo, MemoryRequirements, MemoryTier, Platform,
};

pub use ratelimit::{RateLimitConfig, RateLimiter, RateLimiters};
pub use retry::{classify, ErrorClass, RetryPolicy};

pub use download::{
    BackgroundDownloadManager, DownloadHandle, DownloadPipeline, DownloadRequest, DownloadState,
    DownloadStore, PersistedDownload,
};

pub use config::{load_config, Config};
pub use store::JsonStore;
pub use utils::{format_bytes, mask_sensitive};

// Re-export error utilities
pub use error::{format_error, hub_error, ErrorBuilder, HubError};
