// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Safetensors selection: every weights shard plus known companion files.

use anyhow::Result;

use super::{FileSelector, Selection};
use crate::registry::FileInfo;

const EXTENSION: &str = ".safetensors";

/// Companion files matched by exact lowercase filename.
pub const COMPANION_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "tokenizer.model",
    "special_tokens_map.json",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
    "model.safetensors.index.json",
];

#[derive(Debug, Clone, Default)]
pub struct SafetensorsSelector;

impl SafetensorsSelector {
    pub fn new() -> Self {
        Self
    }
}

impl FileSelector for SafetensorsSelector {
    fn select_files(&self, files: &[FileInfo]) -> Result<Selection> {
        if !files.iter().any(|f| f.has_extension(EXTENSION)) {
            return Ok(Selection::default());
        }
        let selected = files
            .iter()
            .filter(|f| {
                f.has_extension(EXTENSION)
                    || COMPANION_FILES.contains(&f.filename().to_ascii_lowercase().as_str())
            })
            .cloned()
            .collect();
        Ok(Selection::new(selected))
    }
}
