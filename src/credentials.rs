// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry token resolution.
//!
//! A token is looked up in an ordered list of [`TokenSource`]s (environment,
//! secret store, token file by default). The first source that yields a
//! non-empty token wins; a source that errors is logged and skipped.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::sync::{resilient_read, resilient_write};
use crate::utils::mask_sensitive;

/// Key under which the registry token lives in a [`SecretStore`].
pub const TOKEN_KEY: &str = "registry-token";

/// Environment variables checked for a token, in order.
pub const TOKEN_ENV_VARS: &[&str] = &["MODELFETCH_TOKEN", "HF_TOKEN"];

/// Byte-oriented secret storage (keychain or equivalent).
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local secret store, used in tests and as a no-keychain fallback.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(resilient_read(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        resilient_write(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        resilient_write(&self.entries).remove(key);
        Ok(())
    }
}

/// Secret store backed by one file per key with owner-only permissions.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.secret", key))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read secret '{}'", key)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create secrets directory: {:?}", self.dir))?;
        let path = self.path(key);
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to open secret file {:?}", path))?;
        // The mode only applies to new files; tighten an existing one before writing.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict permissions on {:?}", path))?;
        }
        file.write_all(value)
            .with_context(|| format!("Failed to write secret '{}'", key))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete secret '{}'", key)),
        }
    }
}

/// One place a token may come from.
pub trait TokenSource: Send + Sync {
    fn name(&self) -> &str;
    fn token(&self) -> Result<Option<String>>;
}

/// Token from the first set variable in a list of environment variables.
pub struct EnvTokenSource {
    vars: Vec<String>,
}

impl EnvTokenSource {
    pub fn new(vars: &[&str]) -> Self {
        Self {
            vars: vars.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl TokenSource for EnvTokenSource {
    fn name(&self) -> &str {
        "environment"
    }

    fn token(&self) -> Result<Option<String>> {
        Ok(self
            .vars
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .and_then(non_empty))
    }
}

/// Token stored in a [`SecretStore`] under [`TOKEN_KEY`].
pub struct SecretStoreTokenSource {
    store: Arc<dyn SecretStore>,
}

impl SecretStoreTokenSource {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }
}

impl TokenSource for SecretStoreTokenSource {
    fn name(&self) -> &str {
        "secret store"
    }

    fn token(&self) -> Result<Option<String>> {
        let Some(bytes) = self.store.get(TOKEN_KEY)? else {
            return Ok(None);
        };
        let token = String::from_utf8(bytes).context("Stored token is not valid UTF-8")?;
        Ok(non_empty(token))
    }
}

/// Token read from a plain text file (e.g. `~/.cache/huggingface/token`).
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for FileTokenSource {
    fn name(&self) -> &str {
        "token file"
    }

    fn token(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(non_empty(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read token file {:?}", self.path)),
        }
    }
}

/// First non-empty token from `sources`, in order.
pub fn resolve_token(sources: &[Box<dyn TokenSource>]) -> Option<String> {
    for source in sources {
        match source.token() {
            Ok(Some(token)) => {
                tracing::debug!(source = source.name(), token = %mask_sensitive(&token, 4), "Using registry token");
                return Some(token);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(source = source.name(), "Token source failed: {:#}", e),
        }
    }
    None
}

/// The standard lookup order: environment, secret store, token file.
pub fn default_sources(store: Arc<dyn SecretStore>, token_file: Option<PathBuf>) -> Vec<Box<dyn TokenSource>> {
    let mut sources: Vec<Box<dyn TokenSource>> = vec![
        Box::new(EnvTokenSource::new(TOKEN_ENV_VARS)),
        Box::new(SecretStoreTokenSource::new(store)),
    ];
    if let Some(path) = token_file {
        sources.push(Box::new(FileTokenSource::new(path)));
    }
    sources
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
