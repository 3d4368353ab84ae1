// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core ML packaged-model selection.
//!
//! Legacy repositories keep `.mlmodelc` / `.mlpackage` packages (or zip
//! archives of them) at the root. Newer ones split variants into `original/`
//! and `split_einsum/`, each holding `compiled` and `packages` flavours that
//! may be further tagged with an image resolution such as `768x768`.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use super::{FileSelector, Selection};
use crate::registry::FileInfo;

/// Variant directories, most preferred first.
const VARIANTS: &[&str] = &["split_einsum", "original"];

/// Resolution chosen whenever a repository offers it.
pub const PREFERRED_RESOLUTION: &str = "768x768";

/// Root-level files always fetched alongside the model.
pub const METADATA_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "vocab.json",
    "merges.txt",
    "config.json",
    "model_index.json",
];

const COMPILED_PACKAGE: &str = ".mlmodelc";
const SOURCE_PACKAGE: &str = ".mlpackage";

static RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{3,4})x(\d{3,4})").expect("Resolution regex is valid"));

#[derive(Debug, Clone, Default)]
pub struct CoreMlSelector;

impl CoreMlSelector {
    pub fn new() -> Self {
        Self
    }
}

impl FileSelector for CoreMlSelector {
    fn select_files(&self, files: &[FileInfo]) -> Result<Selection> {
        let variant = VARIANTS
            .iter()
            .find(|v| files.iter().any(|f| f.path.starts_with(&format!("{}/", v))));

        let candidates: Vec<&FileInfo> = match variant {
            Some(v) => {
                let prefix = format!("{}/", v);
                files.iter().filter(|f| f.path.starts_with(&prefix)).collect()
            }
            None => files.iter().filter(|f| is_legacy_package_file(f)).collect(),
        };

        let weights = pick_weights(&candidates);
        if weights.is_empty() {
            return Ok(Selection::default());
        }
        tracing::debug!(
            variant = variant.copied().unwrap_or("legacy"),
            files = weights.len(),
            "Selected Core ML files"
        );

        let mut selected = weights;
        for file in files {
            let is_metadata = file.is_root_level()
                && METADATA_FILES.contains(&file.filename().to_ascii_lowercase().as_str());
            if is_metadata && !selected.iter().any(|s| s.path == file.path) {
                selected.push(file.clone());
            }
        }
        Ok(Selection::new(selected))
    }
}

fn is_zip(file: &FileInfo) -> bool {
    file.has_extension(".zip")
}

fn in_package(file: &FileInfo, suffix: &str) -> bool {
    file.path
        .split('/')
        .any(|segment| segment.to_ascii_lowercase().ends_with(suffix))
}

fn is_legacy_package_file(file: &FileInfo) -> bool {
    let first = file.path.split('/').next().unwrap_or("").to_ascii_lowercase();
    (file.is_root_level() && is_zip(file))
        || first.ends_with(COMPILED_PACKAGE)
        || first.ends_with(SOURCE_PACKAGE)
}

/// Reduce variant files to one archived bundle, or else to one set of loose
/// package files.
fn pick_weights(candidates: &[&FileInfo]) -> Vec<FileInfo> {
    let zips: Vec<&FileInfo> = candidates.iter().copied().filter(|f| is_zip(f)).collect();
    if !zips.is_empty() {
        let compiled: Vec<&FileInfo> = zips.iter().copied().filter(|f| contains_ci(&f.path, "compiled")).collect();
        let packages: Vec<&FileInfo> = zips.iter().copied().filter(|f| contains_ci(&f.path, "packages")).collect();
        let flavour = if !compiled.is_empty() {
            compiled
        } else if !packages.is_empty() {
            packages
        } else {
            zips
        };
        let mut bundles = filter_resolution(flavour);
        bundles.sort_by(|a, b| a.path.cmp(&b.path));
        return bundles.into_iter().take(1).cloned().collect();
    }

    let compiled: Vec<&FileInfo> = candidates
        .iter()
        .copied()
        .filter(|f| in_package(f, COMPILED_PACKAGE))
        .collect();
    let loose = if !compiled.is_empty() {
        compiled
    } else {
        candidates
            .iter()
            .copied()
            .filter(|f| in_package(f, SOURCE_PACKAGE))
            .collect()
    };
    let mut loose: Vec<FileInfo> = filter_resolution(loose).into_iter().cloned().collect();
    loose.sort_by(|a, b| a.path.cmp(&b.path));
    loose
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(needle)
}

/// `(width, height)` tag found in a path.
pub fn resolution_of(path: &str) -> Option<(u32, u32)> {
    let caps = RESOLUTION.captures(path)?;
    let width = caps.get(1)?.as_str().parse().ok()?;
    let height = caps.get(2)?.as_str().parse().ok()?;
    Some((width, height))
}

/// Choose among resolution tags: the preferred one if offered, otherwise the
/// median by pixel count (lower middle for an even count).
pub fn choose_resolution(mut tags: Vec<(u32, u32)>) -> Option<(u32, u32)> {
    tags.sort_by_key(|(w, h)| (u64::from(*w) * u64::from(*h), *w));
    tags.dedup();
    if tags.is_empty() {
        return None;
    }
    let preferred = resolution_of(PREFERRED_RESOLUTION);
    if let Some(p) = preferred.filter(|p| tags.contains(p)) {
        return Some(p);
    }
    Some(tags[(tags.len() - 1) / 2])
}

/// Keep only files carrying the chosen resolution when more than one is offered.
fn filter_resolution(files: Vec<&FileInfo>) -> Vec<&FileInfo> {
    let tags: Vec<(u32, u32)> = files.iter().filter_map(|f| resolution_of(&f.path)).collect();
    let mut distinct = tags.clone();
    distinct.sort();
    distinct.dedup();
    if distinct.len() < 2 {
        return files;
    }
    match choose_resolution(tags) {
        Some(chosen) => files
            .into_iter()
            .filter(|f| resolution_of(&f.path) == Some(chosen))
            .collect(),
        None => files,
    }
}
