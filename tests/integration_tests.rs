// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integration tests for modelfetch
//!
//! These tests drive the public API end to end against a local mock registry:
//! listing, selection, memory check, transfer, resume after a restart and
//! the persisted bookkeeping around it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use mockito::{Matcher, Server};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use modelfetch::collaborators::{
    MemoryNotifier, ModelStateAnswer, ModelStateQuery, ModelStateReporter, NotificationKind, StoreModelState,
};
use modelfetch::download::{
    BackgroundDownloadManager, DownloadPipeline, DownloadRequest, DownloadState, DownloadStore,
    FileDownloadDescriptor, PersistedDownload, PipelineOptions, VolumeInfo,
};
use modelfetch::memory::{DeviceMemoryInfo, Platform, GIB};
use modelfetch::ratelimit::{RateLimitConfig, RateLimiters};
use modelfetch::registry::{RegistryClient, RepoKind, Repository};
use modelfetch::retry::RetryPolicy;
use modelfetch::select::Backend;
use modelfetch::store::JsonStore;

struct Unlimited;

impl VolumeInfo for Unlimited {
    fn available_space(&self, _path: &Path) -> Result<u64> {
        Ok(u64::MAX)
    }
}

/// A manager over a state directory, as one process would build it.
struct Process {
    manager: BackgroundDownloadManager,
    notifier: Arc<MemoryNotifier>,
    models: Arc<StoreModelState>,
}

fn process(state_dir: &Path, cache_dir: &Path, device: DeviceMemoryInfo) -> Process {
    let store = JsonStore::open(state_dir).expect("Failed to open state store");
    let quota = RateLimitConfig { requests_per_minute: 6000, burst_size: 200 };
    let retry = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20));
    let client = RegistryClient::new(None, RateLimiters::persistent(quota, quota, &store))
        .expect("Failed to build client")
        .with_retry(retry);
    let options = PipelineOptions {
        workers: 2,
        retry,
        ..PipelineOptions::default()
    };
    let pipeline = DownloadPipeline::new(client, options).with_volume(Arc::new(Unlimited));

    let notifier = Arc::new(MemoryNotifier::default());
    let models = Arc::new(StoreModelState::new(store.clone()));
    let manager = BackgroundDownloadManager::builder(pipeline, DownloadStore::new(store))
        .cache_dir(cache_dir)
        .notifier(notifier.clone())
        .model_state(models.clone())
        .device(device)
        .throttle_interval(Duration::from_millis(0))
        .build();
    Process { manager, notifier, models }
}

fn desktop(total_gib: u64) -> DeviceMemoryInfo {
    DeviceMemoryInfo::new(total_gib * GIB, total_gib * GIB * 3 / 4, Platform::Desktop)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// =============================================================================
// GGUF End-to-End
// =============================================================================

#[tokio::test]
async fn test_gguf_pull_picks_tier_quantization_and_verifies() {
    let mut server = Server::new_async().await;
    let weights = vec![42u8; 4096];
    let tree = serde_json::json!([
        {"type": "file", "path": "README.md", "size": 100},
        {"type": "file", "path": "mistral-7b.Q2_K.gguf", "size": 2048},
        {"type": "file", "path": "mistral-7b.Q4_K_M.gguf", "size": 4096,
         "lfs": {"oid": sha256_hex(&weights), "size": 4096, "pointerSize": 134}},
        {"type": "file", "path": "mistral-7b.Q8_0.gguf", "size": 8192}
    ]);
    let _tree = server
        .mock("GET", "/api/models/TheBloke/Mistral-7B-GGUF/tree/main")
        .match_query(Matcher::Any)
        .with_header("content-type", "application/json")
        .with_body(tree.to_string())
        .create_async()
        .await;
    let chosen = server
        .mock("GET", "/TheBloke/Mistral-7B-GGUF/resolve/main/mistral-7b.Q4_K_M.gguf")
        .with_body(weights.clone())
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let cache = dir.path().join("models");
    let p = process(&dir.path().join("state"), &cache, desktop(24));

    let repo = Repository::parse("TheBloke/Mistral-7B-GGUF", RepoKind::Model, &server.url()).unwrap();
    let mut handle = p.manager.start(DownloadRequest::new(repo)).await.unwrap();
    let done = handle.wait().await;

    assert_eq!(done.state, DownloadState::Completed, "error: {:?}", done.error);
    chosen.assert_async().await;

    let file = cache.join("TheBloke").join("Mistral-7B-GGUF").join("mistral-7b.Q4_K_M.gguf");
    assert_eq!(std::fs::read(&file).unwrap(), weights);

    match p
        .models
        .read(ModelStateQuery::Get { repository: "TheBloke/Mistral-7B-GGUF".into() })
        .unwrap()
    {
        ModelStateAnswer::Model(Some(model)) => {
            assert_eq!(model.backend, Backend::Gguf);
            assert_eq!(model.files, vec!["mistral-7b.Q4_K_M.gguf".to_string()]);
        }
        other => panic!("unexpected answer {:?}", other),
    }
    assert!(p.manager.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_fallback_and_memory_warnings_are_recorded() {
    let mut server = Server::new_async().await;
    // Only an unranked quantization and far more weight than a 4 GiB phone holds.
    let tree = serde_json::json!([
        {"type": "file", "path": "big.IQ1_S.gguf", "size": 12u64 * GIB},
        {"type": "file", "path": "big.Q9_X.gguf", "size": 11u64 * GIB}
    ]);
    let _tree = server
        .mock("GET", "/api/models/org/big/tree/main")
        .match_query(Matcher::Any)
        .with_body(tree.to_string())
        .create_async()
        .await;
    // The transfer itself is refused so the test stays small.
    let _weights = server
        .mock("GET", Matcher::Regex(r"^/org/big/resolve/main/.*$".into()))
        .with_status(403)
        .create_async()
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let phone = DeviceMemoryInfo::new(4 * GIB, 2 * GIB, Platform::Phone);
    let p = process(&dir.path().join("state"), &dir.path().join("models"), phone);

    let repo = Repository::parse("org/big", RepoKind::Model, &server.url()).unwrap();
    let mut handle = p.manager.start(DownloadRequest::new(repo)).await.unwrap();
    let done = handle.wait().await;

    assert_eq!(done.state, DownloadState::Failed);
    assert_eq!(done.warnings.len(), 2, "warnings: {:?}", done.warnings);

    let warnings = p
        .notifier
        .entries()
        .into_iter()
        .filter(|(kind, _)| *kind == NotificationKind::Warning)
        .count();
    assert_eq!(warnings, 2);

    let records = p.manager.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].warnings, done.warnings);
    assert_eq!(records[0].files[0].path, "big.Q9_X.gguf");
}

// =============================================================================
// Restart and Resume
// =============================================================================

#[tokio::test]
async fn test_download_survives_process_restart() {
    let mut server = Server::new_async().await;
    let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    let ranged = server
        .mock("GET", "/org/model/resolve/main/model.safetensors")
        .match_header("range", "bytes=600-")
        .with_status(206)
        .with_body(body[600..].to_vec())
        .expect(1)
        .create_async()
        .await;
    let _config = server
        .mock("GET", "/org/model/resolve/main/config.json")
        .with_body("{\"a\":1}")
        .create_async()
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let state = dir.path().join("state");
    let destination = dir.path().join("models").join("org").join("model");

    // What a process killed mid-transfer leaves behind.
    std::fs::create_dir_all(&destination).unwrap();
    std::fs::write(destination.join("model.safetensors.part"), &body[..600]).unwrap();
    let now = Utc::now();
    let interrupted = PersistedDownload {
        id: "dl-restart".into(),
        repository: "org/model".into(),
        repo_kind: RepoKind::Model,
        endpoint: server.url(),
        revision: "main".into(),
        backend: Backend::Safetensors,
        session_id: "crashed-session".into(),
        destination: destination.clone(),
        files: vec![
            FileDownloadDescriptor {
                path: "model.safetensors".into(),
                size: 1000,
                sha256: Some(sha256_hex(&body)),
                completed: false,
            },
            FileDownloadDescriptor { path: "config.json".into(), size: 7, sha256: None, completed: false },
        ],
        bytes_downloaded: 600,
        total_bytes: 1007,
        state: DownloadState::Downloading,
        error: None,
        warnings: vec![],
        created_at: now,
        updated_at: now,
    };
    DownloadStore::new(JsonStore::open(&state).unwrap()).save(&interrupted).unwrap();

    let p = process(&state, &dir.path().join("models"), desktop(32));
    let restored = p.manager.restore().await.unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].state, DownloadState::Paused);

    let mut handle = p.manager.resume("dl-restart").await.unwrap();
    let done = handle.wait().await;

    assert_eq!(done.state, DownloadState::Completed, "error: {:?}", done.error);
    ranged.assert_async().await;
    assert_eq!(std::fs::read(destination.join("model.safetensors")).unwrap(), body);
    assert_eq!(std::fs::read_to_string(destination.join("config.json")).unwrap(), "{\"a\":1}");
    assert!(!destination.join("model.safetensors.part").exists());
}

#[tokio::test]
async fn test_cancel_cleans_up_after_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let state = dir.path().join("state");
    let destination: PathBuf = dir.path().join("models").join("org").join("model");
    std::fs::create_dir_all(&destination).unwrap();
    std::fs::write(destination.join("weights.safetensors.part"), vec![0u8; 10]).unwrap();

    let now = Utc::now();
    let record = PersistedDownload {
        id: "dl-cancel".into(),
        repository: "org/model".into(),
        repo_kind: RepoKind::Model,
        endpoint: "http://127.0.0.1:9".into(),
        revision: "main".into(),
        backend: Backend::Safetensors,
        session_id: "other".into(),
        destination: destination.clone(),
        files: vec![FileDownloadDescriptor {
            path: "weights.safetensors".into(),
            size: 50,
            sha256: None,
            completed: false,
        }],
        bytes_downloaded: 10,
        total_bytes: 50,
        state: DownloadState::Downloading,
        error: None,
        warnings: vec![],
        created_at: now,
        updated_at: now,
    };
    DownloadStore::new(JsonStore::open(&state).unwrap()).save(&record).unwrap();

    let p = process(&state, &dir.path().join("models"), desktop(16));
    p.manager.restore().await.unwrap();
    p.manager.cancel("dl-cancel").await.unwrap();

    assert!(!destination.join("weights.safetensors.part").exists());
    assert!(p.manager.list().unwrap().is_empty());
    assert!(p.manager.progress("dl-cancel").unwrap().is_none());
}

// =============================================================================
// Registry Listing
// =============================================================================

#[tokio::test]
async fn test_dataset_listing_uses_dataset_routes() {
    let mut server = Server::new_async().await;
    let listing = server
        .mock("GET", "/api/datasets/org/corpus/tree/v1.0")
        .match_query(Matcher::Any)
        .with_body(r#"[{"type": "file", "path": "data/train.parquet", "size": 10}, {"type": "directory", "path": "data", "size": 0}]"#)
        .create_async()
        .await;

    let quota = RateLimitConfig::anonymous();
    let client = RegistryClient::new(None, RateLimiters::in_memory(quota, quota)).unwrap();
    let repo = Repository::parse("org/corpus", RepoKind::Dataset, &server.url()).unwrap();
    let files = client.list_files(&repo, "v1.0", None, None).await.unwrap();

    listing.assert_async().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "data/train.parquet");
    assert_eq!(
        RegistryClient::resolve_url(&repo, "v1.0", "data/train.parquet"),
        format!("{}/datasets/org/corpus/resolve/v1.0/data/train.parquet", server.url())
    );
}
