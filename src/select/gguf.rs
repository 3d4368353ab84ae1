// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! GGUF quantized-weights selection.

use std::collections::HashMap;

use anyhow::Result;

use super::quant::{detect_quantization, QuantizationLevel};
use super::{FileSelector, Selection};
use crate::error::HubError;
use crate::memory::MemoryTier;
use crate::registry::FileInfo;

const EXTENSION: &str = ".gguf";

/// Picks one quantization level (all of its shards) for the host's memory tier.
#[derive(Debug, Clone)]
pub struct GgufSelector {
    tier: MemoryTier,
    filename: Option<String>,
}

impl GgufSelector {
    pub fn new(tier: MemoryTier) -> Self {
        Self { tier, filename: None }
    }

    /// Require files whose path contains `filename` instead of choosing by tier.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }
}

impl FileSelector for GgufSelector {
    fn select_files(&self, files: &[FileInfo]) -> Result<Selection> {
        let weights: Vec<&FileInfo> = files.iter().filter(|f| f.has_extension(EXTENSION)).collect();
        if weights.is_empty() {
            return Ok(Selection::default());
        }

        if let Some(name) = &self.filename {
            let matched: Vec<FileInfo> = weights
                .iter()
                .filter(|f| f.path.contains(name.as_str()))
                .map(|f| (*f).clone())
                .collect();
            if matched.is_empty() {
                return Err(HubError::FileNotFound(name.clone()).into());
            }
            return Ok(Selection::new(matched));
        }

        let mut by_level: HashMap<QuantizationLevel, Vec<FileInfo>> = HashMap::new();
        for file in &weights {
            if let Some(level) = detect_quantization(&file.path) {
                by_level.entry(level).or_default().push((*file).clone());
            }
        }

        for level in self.tier.preferences() {
            if let Some(mut shards) = by_level.remove(level) {
                shards.sort_by(|a, b| a.path.cmp(&b.path));
                tracing::debug!(tier = %self.tier, level = %level, shards = shards.len(), "Selected quantization");
                return Ok(Selection::new(shards));
            }
        }

        // Non-empty by the early return above.
        let Some(smallest) = weights.iter().min_by_key(|f| f.size) else {
            return Ok(Selection::default());
        };
        let warning = format!(
            "No preferred quantization for the {} memory tier, falling back to the smallest file {}",
            self.tier, smallest.path
        );
        tracing::warn!("{}", warning);
        Ok(Selection::new(vec![(*smallest).clone()]).with_warning(warning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::hub_error;

    fn listing() -> Vec<FileInfo> {
        vec![
            FileInfo::new("README.md", 5),
            FileInfo::new("model.Q8_0.gguf", 8_000),
            FileInfo::new("model.Q5_K_M.gguf", 5_000),
            FileInfo::new("model.Q4_K_M.gguf", 4_000),
        ]
    }

    fn paths(selection: &Selection) -> Vec<&str> {
        selection.files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_medium_tier_prefers_q4_k_m() {
        let selection = GgufSelector::new(MemoryTier::Medium).select_files(&listing()).unwrap();
        assert_eq!(paths(&selection), vec!["model.Q4_K_M.gguf"]);
        assert!(selection.warnings.is_empty());
    }

    #[test]
    fn test_high_tier_prefers_q8_0() {
        let selection = GgufSelector::new(MemoryTier::High).select_files(&listing()).unwrap();
        assert_eq!(paths(&selection), vec!["model.Q8_0.gguf"]);
    }

    #[test]
    fn test_low_tier_walks_preference_list() {
        // No Q3/Q2/Q4_K_S/Q4_0 present, so the last low-tier entry wins.
        let selection = GgufSelector::new(MemoryTier::Low).select_files(&listing()).unwrap();
        assert_eq!(paths(&selection), vec!["model.Q4_K_M.gguf"]);
    }

    #[test]
    fn test_returns_all_shards_of_level() {
        let files = vec![
            FileInfo::new("Q8_0/model-Q8_0-00002-of-00002.gguf", 100),
            FileInfo::new("Q8_0/model-Q8_0-00001-of-00002.gguf", 100),
            FileInfo::new("model-Q2_K.gguf", 30),
        ];
        let selection = GgufSelector::new(MemoryTier::High).select_files(&files).unwrap();
        assert_eq!(
            paths(&selection),
            vec!["Q8_0/model-Q8_0-00001-of-00002.gguf", "Q8_0/model-Q8_0-00002-of-00002.gguf"]
        );
    }

    #[test]
    fn test_fallback_to_smallest_is_reported() {
        let files = vec![
            FileInfo::new("model-F16.gguf", 14_000),
            FileInfo::new("model-IQ4_XS.gguf", 3_900),
        ];
        let selection = GgufSelector::new(MemoryTier::Medium).select_files(&files).unwrap();
        assert_eq!(paths(&selection), vec!["model-IQ4_XS.gguf"]);
        assert_eq!(selection.warnings.len(), 1);
        assert!(selection.warnings[0].contains("model-IQ4_XS.gguf"));
    }

    #[test]
    fn test_named_file() {
        let selector = GgufSelector::new(MemoryTier::Low).with_filename("Q8_0");
        let selection = selector.select_files(&listing()).unwrap();
        assert_eq!(paths(&selection), vec!["model.Q8_0.gguf"]);

        let missing = GgufSelector::new(MemoryTier::Low).with_filename("Q9");
        let err = missing.select_files(&listing()).unwrap_err();
        assert_eq!(hub_error(&err), Some(&HubError::FileNotFound("Q9".to_string())));
    }

    #[test]
    fn test_empty_input() {
        let selection = GgufSelector::new(MemoryTier::Low).select_files(&[]).unwrap();
        assert!(selection.is_empty());
        let selection = GgufSelector::new(MemoryTier::Low)
            .select_files(&[FileInfo::new("model.safetensors", 1)])
            .unwrap();
        assert!(selection.is_empty());
    }
}
