// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP client for the registry API.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, ETAG, LINK, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use super::types::{FileInfo, FileMetadata, Repository, SnapshotPlan, TreeEntry};
use crate::error::HubError;
use crate::ratelimit::RateLimiters;
use crate::retry::RetryPolicy;

/// Default timeout for connection establishment (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Default timeout for catalog requests (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for listing repositories and fetching file content.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    token: Option<String>,
    limiters: RateLimiters,
    request_timeout: Duration,
    /// Applied to catalog requests; content transfers retry in the pipeline.
    retry: RetryPolicy,
}

impl RegistryClient {
    /// Create a client. `token` is sent as a bearer token on every request.
    pub fn new(token: Option<String>, limiters: RateLimiters) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .user_agent(concat!("modelfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            token,
            limiters,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        })
    }

    /// Set the retry policy for listing and metadata requests.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set a custom timeout for catalog (non-content) requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn throttle(&self) -> Result<()> {
        self.limiters.for_auth(self.has_token()).wait_if_needed().await
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response> {
        self.throttle().await?;
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| send_error(e, url))?;
        check_status(response, url)
    }

    pub fn tree_url(repo: &Repository, revision: &str) -> String {
        format!(
            "{}/api/{}/{}/{}/tree/{}?recursive=true",
            repo.endpoint(),
            repo.kind().api_segment(),
            repo.namespace(),
            repo.name(),
            encode_revision(revision)
        )
    }

    pub fn resolve_url(repo: &Repository, revision: &str, path: &str) -> String {
        format!(
            "{}/{}{}/{}/resolve/{}/{}",
            repo.endpoint(),
            repo.kind().url_prefix(),
            repo.namespace(),
            repo.name(),
            encode_revision(revision),
            path.trim_start_matches('/')
        )
    }

    /// List every file in the repository, optionally filtered by one include
    /// and one exclude glob.
    pub async fn list_files(
        &self,
        repo: &Repository,
        revision: &str,
        include: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<Vec<FileInfo>> {
        let includes: Vec<String> = include.into_iter().map(String::from).collect();
        let excludes: Vec<String> = exclude.into_iter().map(String::from).collect();
        self.list_files_matching(repo, revision, &includes, &excludes).await
    }

    /// List every file, keeping paths that match any include glob (all when
    /// empty) and none of the exclude globs.
    pub async fn list_files_matching(
        &self,
        repo: &Repository,
        revision: &str,
        includes: &[String],
        excludes: &[String],
    ) -> Result<Vec<FileInfo>> {
        let filter = GlobFilter::new(includes, excludes)?;
        let mut files = Vec::new();
        let mut next = Some(Self::tree_url(repo, revision));

        let never = CancellationToken::new();

        while let Some(url) = next.take() {
            let (entries, link) = self
                .retry
                .run(&never, |_| self.list_page(&url))
                .await
                .with_context(|| format!("Failed to list files of {}", repo))?;
            next = link;
            files.extend(entries.into_iter().filter_map(TreeEntry::into_file));
        }

        let before = files.len();
        files.retain(|f| filter.matches(&f.path));
        tracing::debug!(repo = %repo, revision, total = before, kept = files.len(), "Listed repository files");
        Ok(files)
    }

    /// One page of the tree endpoint and the URL of the next page.
    async fn list_page(&self, url: &str) -> Result<(Vec<TreeEntry>, Option<String>)> {
        let request = self.http.get(url).timeout(self.request_timeout);
        let response = self.send(request, url).await?;
        let next = next_link(response.headers());
        let entries: Vec<TreeEntry> = response.json().await.map_err(|e| {
            if e.is_decode() {
                anyhow::Error::new(e).context(format!("Failed to parse file listing from {}", url))
            } else {
                send_error(e, url)
            }
        })?;
        Ok((entries, next))
    }

    /// HEAD a file for its size and ETag.
    pub async fn file_metadata(&self, repo: &Repository, path: &str, revision: &str) -> Result<FileMetadata> {
        let url = Self::resolve_url(repo, revision, path);
        let response = self
            .retry
            .run(&CancellationToken::new(), |_| {
                let request = self.http.head(&url).timeout(self.request_timeout);
                self.send(request, &url)
            })
            .await?;

        // Content-Length is read from the header: a HEAD body is always empty.
        let headers = response.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag);

        Ok(FileMetadata {
            url: response.url().to_string(),
            size,
            etag,
        })
    }

    /// Split a filtered listing into files still to fetch and files already
    /// present in `cache_dir` with the listed size.
    pub async fn snapshot_plan(
        &self,
        repo: &Repository,
        revision: &str,
        includes: &[String],
        excludes: &[String],
        cache_dir: &Path,
    ) -> Result<SnapshotPlan> {
        let files = self.list_files_matching(repo, revision, includes, excludes).await?;
        Ok(plan_against_cache(files, cache_dir))
    }

    /// GET file content, starting at `offset` when given.
    ///
    /// The response is returned unread so the caller can stream it.
    pub async fn fetch(
        &self,
        repo: &Repository,
        path: &str,
        revision: &str,
        offset: Option<u64>,
    ) -> Result<Response> {
        let url = Self::resolve_url(repo, revision, path);
        let mut request = self.http.get(&url);
        if let Some(offset) = offset.filter(|o| *o > 0) {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        self.send(request, &url).await
    }
}

/// Split `files` by whether `cache_dir/<path>` already holds the listed size.
pub fn plan_against_cache(files: Vec<FileInfo>, cache_dir: &Path) -> SnapshotPlan {
    let mut plan = SnapshotPlan::default();
    for file in files {
        let cached = file
            .local_path(cache_dir)
            .ok()
            .and_then(|path| std::fs::metadata(path).ok())
            .is_some_and(|m| m.is_file() && m.len() == file.size);
        if cached {
            plan.already_cached.push(file);
        } else {
            plan.to_download.push(file);
        }
    }
    plan
}

/// Include-then-exclude shell glob filter.
struct GlobFilter {
    includes: Vec<glob::Pattern>,
    excludes: Vec<glob::Pattern>,
}

impl GlobFilter {
    fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| glob::Pattern::new(p).with_context(|| format!("Invalid glob pattern '{}'", p)))
                .collect()
        };
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    fn matches(&self, path: &str) -> bool {
        let included = self.includes.is_empty() || self.includes.iter().any(|p| p.matches(path));
        included && !self.excludes.iter().any(|p| p.matches(path))
    }
}

fn encode_revision(revision: &str) -> String {
    revision.replace('/', "%2F")
}

/// Strip quotes and a weak-validator prefix from an ETag value.
fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

/// URL of the `rel="next"` page in a `Link` header.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(String::from)
    })
}

fn send_error(e: reqwest::Error, url: &str) -> anyhow::Error {
    let hub = if e.is_timeout() {
        HubError::Timeout(format!("{} ({})", url, e))
    } else {
        HubError::Network(format!("{} ({})", url, e))
    };
    anyhow::Error::new(hub)
}

fn check_status(response: Response, url: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let err = match status {
        StatusCode::UNAUTHORIZED => HubError::AuthenticationRequired(format!("{} returned 401", url)),
        StatusCode::NOT_FOUND => HubError::NotFound(url.to_string()),
        _ => HubError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        },
    };
    tracing::debug!(status = status.as_u16(), url, "Registry request failed");
    Err(err.into())
}
