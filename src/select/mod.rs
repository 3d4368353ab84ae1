// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Backend file selection.
//!
//! Each backend reduces a repository listing to the minimal set of files it
//! needs. Selection is pure: no I/O, and an empty listing gives an empty
//! selection rather than an error.

pub mod coreml;
pub mod gguf;
pub mod quant;
pub mod safetensors;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::memory::MemoryTier;
use crate::registry::FileInfo;

pub use coreml::CoreMlSelector;
pub use gguf::GgufSelector;
pub use quant::{detect_quantization, QuantizationLevel};
pub use safetensors::SafetensorsSelector;

/// Files chosen for download plus anything the caller should be told about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub files: Vec<FileInfo>,
    pub warnings: Vec<String>,
}

impl Selection {
    pub fn new(files: Vec<FileInfo>) -> Self {
        Self {
            files,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Reduces a repository listing to the files one backend needs.
pub trait FileSelector: Send + Sync {
    fn select_files(&self, files: &[FileInfo]) -> Result<Selection>;
}

/// Packaging format a repository is consumed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Gguf,
    CoreMl,
    Safetensors,
}

impl Backend {
    /// Guess the backend from file extensions. GGUF wins when a repository
    /// mixes formats.
    pub fn detect(files: &[FileInfo]) -> Option<Backend> {
        if files.iter().any(|f| f.has_extension(".gguf")) {
            return Some(Backend::Gguf);
        }
        let is_coreml = files.iter().any(|f| {
            let lower = f.path.to_ascii_lowercase();
            lower.contains(".mlmodelc") || lower.contains(".mlpackage")
                || (f.has_extension(".zip")
                    && (lower.starts_with("split_einsum/") || lower.starts_with("original/")))
        });
        if is_coreml {
            return Some(Backend::CoreMl);
        }
        if files.iter().any(|f| f.has_extension(".safetensors")) {
            return Some(Backend::Safetensors);
        }
        None
    }

    /// Selector for this backend, tuned to the host memory tier.
    pub fn selector(&self, tier: MemoryTier, filename: Option<&str>) -> Box<dyn FileSelector> {
        match self {
            Backend::Gguf => {
                let selector = GgufSelector::new(tier);
                match filename {
                    Some(name) => Box::new(selector.with_filename(name)),
                    None => Box::new(selector),
                }
            }
            Backend::CoreMl => Box::new(CoreMlSelector::new()),
            Backend::Safetensors => Box::new(SafetensorsSelector::new()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Gguf => write!(f, "gguf"),
            Backend::CoreMl => write!(f, "coreml"),
            Backend::Safetensors => write!(f, "safetensors"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gguf" => Ok(Backend::Gguf),
            "coreml" | "core-ml" => Ok(Backend::CoreMl),
            "safetensors" => Ok(Backend::Safetensors),
            other => Err(format!("unknown backend '{}' (expected gguf, coreml or safetensors)", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_backend() {
        let gguf = vec![FileInfo::new("model.safetensors", 1), FileInfo::new("model.Q4_0.gguf", 1)];
        assert_eq!(Backend::detect(&gguf), Some(Backend::Gguf));

        let coreml = vec![FileInfo::new("split_einsum/compiled.zip", 1)];
        assert_eq!(Backend::detect(&coreml), Some(Backend::CoreMl));

        let legacy = vec![FileInfo::new("Model.mlpackage/Data/weight.bin", 1)];
        assert_eq!(Backend::detect(&legacy), Some(Backend::CoreMl));

        let st = vec![FileInfo::new("model.safetensors", 1)];
        assert_eq!(Backend::detect(&st), Some(Backend::Safetensors));

        assert_eq!(Backend::detect(&[FileInfo::new("README.md", 1)]), None);
        assert_eq!(Backend::detect(&[]), None);
    }

    #[test]
    fn test_backend_parse_and_display() {
        for backend in [Backend::Gguf, Backend::CoreMl, Backend::Safetensors] {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
        assert!("onnx".parse::<Backend>().is_err());
    }

    #[test]
    fn test_selector_dispatch() {
        let files = vec![
            FileInfo::new("model.Q4_K_M.gguf", 4),
            FileInfo::new("model.Q8_0.gguf", 8),
        ];
        let selection = Backend::Gguf
            .selector(MemoryTier::High, None)
            .select_files(&files)
            .unwrap();
        assert_eq!(selection.files[0].path, "model.Q8_0.gguf");
        assert_eq!(selection.total_bytes(), 8);
    }
}
