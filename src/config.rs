// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration stored in `~/.modelfetch/config.json`.
//!
//! Every field has a serde default, so a partial (or missing) file is valid.
//! `MODELFETCH_ENDPOINT` and `MODELFETCH_CACHE_DIR` override the file; CLI
//! flags override both.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitConfig;
use crate::registry::DEFAULT_ENDPOINT;
use crate::retry::RetryPolicy;

pub const ENDPOINT_ENV: &str = "MODELFETCH_ENDPOINT";
pub const CACHE_DIR_ENV: &str = "MODELFETCH_CACHE_DIR";

/// Allowed range for concurrent file transfers.
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Registry base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Where downloaded repositories are placed (default: ~/.modelfetch/models)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Where download records and limiter state live (default: ~/.modelfetch/state)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Concurrent file transfers per download, 1 to 8
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Free space required as a multiple of the download size
    #[serde(default = "default_space_multiplier")]
    pub space_multiplier: f64,
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest wait for one chunk of a transfer
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Runtime overhead on top of the weights when estimating memory
    #[serde(default = "default_overhead_fraction")]
    pub overhead_fraction: f64,
    /// Plain-text token file checked after the environment and secret store
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_revision() -> String {
    "main".to_string()
}

fn default_workers() -> usize {
    3
}

fn default_space_multiplier() -> f64 {
    1.2
}

fn default_progress_throttle_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_chunk_timeout_secs() -> u64 {
    60
}

fn default_overhead_fraction() -> f64 {
    0.25
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            cache_dir: None,
            state_dir: None,
            revision: default_revision(),
            workers: default_workers(),
            rate_limits: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            space_multiplier: default_space_multiplier(),
            progress_throttle_ms: default_progress_throttle_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            overhead_fraction: default_overhead_fraction(),
            token_file: None,
        }
    }
}

/// Limiter quotas by auth state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "RateLimitConfig::authenticated")]
    pub authenticated: RateLimitConfig,
    #[serde(default = "RateLimitConfig::anonymous")]
    pub anonymous: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            authenticated: RateLimitConfig::authenticated(),
            anonymous: RateLimitConfig::anonymous(),
        }
    }
}

/// Retry policy in config-file units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter_fraction)
    }
}

impl Config {
    /// Worker count clamped to the supported range.
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| app_dir().join("models"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| app_dir().join("state"))
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.state_dir().join("secrets")
    }

    /// Configured token file, or the one the registry's own CLI writes.
    pub fn token_file(&self) -> Option<PathBuf> {
        self.token_file
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".cache").join("huggingface").join("token")))
    }

    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Apply environment overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            self.endpoint = endpoint.trim().trim_end_matches('/').to_string();
        }
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }
}

/// `~/.modelfetch`
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".modelfetch"))
        .unwrap_or_else(|| PathBuf::from(".modelfetch"))
}

pub fn config_path() -> PathBuf {
    app_dir().join("config.json")
}

/// Load `~/.modelfetch/config.json` and apply environment overrides.
pub fn load_config() -> Result<Config> {
    let mut config = Config::load_from(&config_path())?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_path())
}
