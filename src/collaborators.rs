// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Contracts for the parts of the host application the download manager
//! reports to: a notification sink and a model-state registry.

use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::select::Backend;
use crate::store::JsonStore;
use crate::sync::{resilient_read, resilient_write};

const MODELS: &str = "models";

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DownloadCompleted,
    DownloadFailed,
    DownloadCancelled,
    Warning,
}

/// Receives user-facing notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: NotificationKind, message: &str);
}

/// Sink that writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, kind: NotificationKind, message: &str) {
        match kind {
            NotificationKind::DownloadCompleted | NotificationKind::DownloadCancelled => {
                tracing::info!(target: "modelfetch::notify", kind = ?kind, "{}", message)
            }
            NotificationKind::DownloadFailed | NotificationKind::Warning => {
                tracing::warn!(target: "modelfetch::notify", kind = ?kind, "{}", message)
            }
        }
    }
}

/// Sink that keeps every notification, for embedding hosts that poll.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    entries: RwLock<Vec<(NotificationKind, String)>>,
}

impl MemoryNotifier {
    pub fn entries(&self) -> Vec<(NotificationKind, String)> {
        resilient_read(&self.entries).clone()
    }
}

impl NotificationSink for MemoryNotifier {
    fn notify(&self, kind: NotificationKind, message: &str) {
        resilient_write(&self.entries).push((kind, message.to_string()));
    }
}

/// A model that finished downloading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub repository: String,
    pub backend: Backend,
    pub path: PathBuf,
    #[serde(default)]
    pub files: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Mutations accepted by a [`ModelStateReporter`].
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStateCommand {
    MarkDownloaded(ModelRecord),
    MarkRemoved { repository: String },
}

/// Queries accepted by a [`ModelStateReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStateQuery {
    Get { repository: String },
    List,
}

/// Answers to a [`ModelStateQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStateAnswer {
    Model(Option<ModelRecord>),
    Models(Vec<ModelRecord>),
}

/// Registry of downloaded models owned by the host application.
pub trait ModelStateReporter: Send + Sync {
    fn write(&self, command: ModelStateCommand) -> Result<()>;
    fn read(&self, query: ModelStateQuery) -> Result<ModelStateAnswer>;
}

/// Reporter for hosts that do not track models.
#[derive(Debug, Default, Clone)]
pub struct NoopModelState;

impl ModelStateReporter for NoopModelState {
    fn write(&self, _command: ModelStateCommand) -> Result<()> {
        Ok(())
    }

    fn read(&self, query: ModelStateQuery) -> Result<ModelStateAnswer> {
        Ok(match query {
            ModelStateQuery::Get { .. } => ModelStateAnswer::Model(None),
            ModelStateQuery::List => ModelStateAnswer::Models(Vec::new()),
        })
    }
}

/// Reporter persisting records in the `models` collection of a [`JsonStore`].
#[derive(Debug, Clone)]
pub struct StoreModelState {
    store: JsonStore,
}

impl StoreModelState {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }
}

impl ModelStateReporter for StoreModelState {
    fn write(&self, command: ModelStateCommand) -> Result<()> {
        match command {
            ModelStateCommand::MarkDownloaded(record) => self.store.save(MODELS, &record.repository, &record),
            ModelStateCommand::MarkRemoved { repository } => self.store.remove(MODELS, &repository),
        }
    }

    fn read(&self, query: ModelStateQuery) -> Result<ModelStateAnswer> {
        match query {
            ModelStateQuery::Get { repository } => Ok(ModelStateAnswer::Model(self.store.load(MODELS, &repository)?)),
            ModelStateQuery::List => {
                let mut models: Vec<ModelRecord> = self.store.load_all(MODELS)?;
                models.sort_by(|a, b| a.repository.cmp(&b.repository));
                Ok(ModelStateAnswer::Models(models))
            }
        }
    }
}
