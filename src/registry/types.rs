// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry data types.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Default public registry endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// What kind of repository an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    #[default]
    Model,
    Dataset,
    Space,
}

impl RepoKind {
    /// Segment used by the `/api/{kind}s/...` routes.
    pub fn api_segment(&self) -> &'static str {
        match self {
            RepoKind::Model => "models",
            RepoKind::Dataset => "datasets",
            RepoKind::Space => "spaces",
        }
    }

    /// Prefix in front of `namespace/name` on content routes.
    pub fn url_prefix(&self) -> &'static str {
        match self {
            RepoKind::Model => "",
            RepoKind::Dataset => "datasets/",
            RepoKind::Space => "spaces/",
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoKind::Model => write!(f, "model"),
            RepoKind::Dataset => write!(f, "dataset"),
            RepoKind::Space => write!(f, "space"),
        }
    }
}

impl FromStr for RepoKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().trim_end_matches('s') {
            "model" => Ok(RepoKind::Model),
            "dataset" => Ok(RepoKind::Dataset),
            "space" => Ok(RepoKind::Space),
            other => Err(format!("unknown repository kind '{}' (expected model, dataset or space)", other)),
        }
    }
}

/// A repository location on a registry. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    namespace: String,
    name: String,
    kind: RepoKind,
    endpoint: String,
}

impl Repository {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        kind: RepoKind,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    /// Parse a `namespace/name` id.
    pub fn parse(id: &str, kind: RepoKind, endpoint: &str) -> Result<Self, HubError> {
        let mut parts = id.trim().split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if valid_segment(ns) && valid_segment(name) => {
                Ok(Self::new(ns, name, kind, endpoint))
            }
            _ => Err(HubError::InvalidRepository(id.to_string())),
        }
    }

    /// Model repository on the default endpoint.
    pub fn model(id: &str) -> Result<Self, HubError> {
        Self::parse(id, RepoKind::Model, DEFAULT_ENDPOINT)
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(char::is_whitespace)
}

/// A `/`-separated relative path that stays below the directory it is joined to.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && !path.contains(':')
        && path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

/// Large-file-storage pointer attached to a listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LfsPointer {
    /// SHA-256 of the object content, hex encoded.
    pub oid: String,
    pub size: u64,
    #[serde(default)]
    pub pointer_size: u64,
}

/// One file in a repository listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lfs: Option<LfsPointer>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            lfs: None,
        }
    }

    /// Last path component.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Directory part of the path, empty for root-level files.
    pub fn directory(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }

    pub fn is_root_level(&self) -> bool {
        !self.path.contains('/')
    }

    /// Case-insensitive suffix check.
    pub fn has_extension(&self, ext: &str) -> bool {
        self.path.to_ascii_lowercase().ends_with(&ext.to_ascii_lowercase())
    }

    /// Where this file lands under `dest_dir`.
    ///
    /// Fails with [`HubError::InvalidPath`] for absolute paths and for paths
    /// with empty, `.` or `..` segments.
    pub fn local_path(&self, dest_dir: &Path) -> Result<PathBuf, HubError> {
        if !is_safe_relative_path(&self.path) {
            return Err(HubError::InvalidPath(self.path.clone()));
        }
        Ok(self.path.split('/').fold(dest_dir.to_path_buf(), |acc, seg| acc.join(seg)))
    }

    /// Content hash to verify against, when the registry gave one.
    pub fn sha256(&self) -> Option<&str> {
        self.lfs
            .as_ref()
            .map(|l| l.oid.as_str())
            .filter(|oid| oid.len() == 64 && oid.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

/// Metadata from a HEAD request on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub url: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
}

/// Result of comparing a listing against a local cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPlan {
    pub to_download: Vec<FileInfo>,
    pub already_cached: Vec<FileInfo>,
}

impl SnapshotPlan {
    pub fn bytes_to_download(&self) -> u64 {
        self.to_download.iter().map(|f| f.size).sum()
    }
}

/// Raw entry of the tree endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TreeEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub lfs: Option<LfsPointer>,
}

impl TreeEntry {
    pub fn into_file(self) -> Option<FileInfo> {
        if self.kind != "file" {
            return None;
        }
        if !is_safe_relative_path(&self.path) {
            tracing::warn!(path = %self.path, "Dropping listing entry with an unsafe path");
            return None;
        }
        Some(FileInfo {
            path: self.path,
            size: self.size,
            lfs: self.lfs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repository() {
        let repo = Repository::parse("TheBloke/Llama-2-7B-GGUF", RepoKind::Model, "https://hub.example/").unwrap();
        assert_eq!(repo.id(), "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(repo.namespace(), "TheBloke");
        assert_eq!(repo.endpoint(), "https://hub.example");
    }

    #[test]
    fn test_repo_kind_from_str() {
        assert_eq!("model".parse::<RepoKind>(), Ok(RepoKind::Model));
        assert_eq!("Datasets".parse::<RepoKind>(), Ok(RepoKind::Dataset));
        assert_eq!("space".parse::<RepoKind>(), Ok(RepoKind::Space));
        assert!("collection".parse::<RepoKind>().is_err());
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        for id in ["", "justname", "a/b/c", "/name", "ns/", "ns/na me"] {
            assert_eq!(
                Repository::model(id),
                Err(HubError::InvalidRepository(id.to_string())),
                "id {:?}",
                id
            );
        }
    }

    #[test]
    fn test_file_info_paths() {
        let file = FileInfo::new("split_einsum/compiled/model.zip", 10);
        assert_eq!(file.filename(), "model.zip");
        assert_eq!(file.directory(), "split_einsum/compiled");
        assert!(!file.is_root_level());
        assert!(FileInfo::new("config.json", 1).is_root_level());
        assert!(FileInfo::new("Model.GGUF", 1).has_extension(".gguf"));
    }

    #[test]
    fn test_tree_entry_filters_directories() {
        let entries: Vec<TreeEntry> = serde_json::from_str(
            r#"[
                {"type": "directory", "path": "original", "size": 0},
                {"type": "file", "path": "model.gguf", "size": 42,
                 "lfs": {"oid": "abc", "size": 42, "pointerSize": 134}}
            ]"#,
        )
        .unwrap();
        let files: Vec<FileInfo> = entries.into_iter().filter_map(TreeEntry::into_file).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].lfs.as_ref().unwrap().pointer_size, 134);
    }

    #[test]
    fn test_unsafe_listing_paths_dropped() {
        let entries: Vec<TreeEntry> = serde_json::from_str(
            r#"[
                {"type": "file", "path": "../../escaped.safetensors", "size": 5},
                {"type": "file", "path": "/etc/passwd", "size": 5},
                {"type": "file", "path": "a//b.bin", "size": 5},
                {"type": "file", "path": "./model.bin", "size": 5},
                {"type": "file", "path": "sub/model.bin", "size": 5}
            ]"#,
        )
        .unwrap();
        let files: Vec<FileInfo> = entries.into_iter().filter_map(TreeEntry::into_file).collect();
        assert_eq!(files, vec![FileInfo::new("sub/model.bin", 5)]);
    }

    #[test]
    fn test_local_path_stays_under_destination() {
        let dest = Path::new("/models/org/model");
        assert_eq!(
            FileInfo::new("sub/model.bin", 1).local_path(dest).unwrap(),
            PathBuf::from("/models/org/model/sub/model.bin")
        );
        for bad in ["../../x", "/etc/x", "a/../../x", "", "a/./b", "C:\\x", "a\\..\\b"] {
            assert_eq!(
                FileInfo::new(bad, 1).local_path(dest),
                Err(HubError::InvalidPath(bad.to_string())),
                "path {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_sha256_only_for_full_digests() {
        let mut file = FileInfo::new("a.bin", 1);
        assert_eq!(file.sha256(), None);
        file.lfs = Some(LfsPointer { oid: "abc".into(), size: 1, pointer_size: 0 });
        assert_eq!(file.sha256(), None);
        let digest = "a".repeat(64);
        file.lfs = Some(LfsPointer { oid: digest.clone(), size: 1, pointer_size: 0 });
        assert_eq!(file.sha256(), Some(digest.as_str()));
    }
}
