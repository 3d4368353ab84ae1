// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token-bucket rate limiting with state that survives restarts.
//!
//! The bucket holds up to `burst_size` tokens and refills at
//! `requests_per_minute / 60` tokens per second of wall-clock time. After every
//! change the bucket is written to the [`JsonStore`], so a restarted process
//! picks up the remaining tokens (plus whatever refilled while it was down)
//! instead of starting from a full bucket.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::JsonStore;

const COLLECTION: &str = "ratelimit";

/// Quota for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl RateLimitConfig {
    /// Registry quota for requests carrying a token.
    pub fn authenticated() -> Self {
        Self { requests_per_minute: 1000, burst_size: 100 }
    }

    /// Registry quota for anonymous requests.
    pub fn anonymous() -> Self {
        Self { requests_per_minute: 300, burst_size: 30 }
    }

    fn refill_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }
}

/// Persisted bucket snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
}

impl RateLimiterState {
    fn full(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            tokens: f64::from(config.burst_size),
            last_refill: now,
        }
    }

    /// Add tokens for the time elapsed since `last_refill`, capped at burst size.
    ///
    /// A clock that moved backwards refills nothing and keeps `last_refill`.
    fn refill(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).to_std().unwrap_or(Duration::ZERO);
        if elapsed.is_zero() {
            return;
        }
        let burst = f64::from(config.burst_size);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * config.refill_per_second()).min(burst);
        self.last_refill = now;
    }

    fn clamp(mut self, config: &RateLimitConfig) -> Self {
        if !self.tokens.is_finite() || self.tokens < 0.0 {
            self.tokens = 0.0;
        }
        self.tokens = self.tokens.min(f64::from(config.burst_size));
        self
    }
}

struct Inner {
    state: RateLimiterState,
    /// Bumped on every change, so older snapshots never overwrite newer ones.
    version: u64,
}

/// Token-bucket limiter identified by `name` in the state store.
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    store: Option<JsonStore>,
    inner: Mutex<Inner>,
    /// Version of the last snapshot written to the store.
    persisted: Mutex<u64>,
}

impl RateLimiter {
    /// In-memory limiter starting with a full bucket.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            store: None,
            inner: Mutex::new(Inner {
                state: RateLimiterState::full(&config, Utc::now()),
                version: 0,
            }),
            persisted: Mutex::new(0),
        }
    }

    /// Limiter restored from `store`, refilled for the time since it was last saved.
    ///
    /// Missing or unreadable state falls back to a full bucket at "now".
    pub fn persistent(name: impl Into<String>, config: RateLimitConfig, store: JsonStore) -> Self {
        let name = name.into();
        let now = Utc::now();
        let state = match store.load::<RateLimiterState>(COLLECTION, &name) {
            Ok(Some(saved)) => {
                let mut state = saved.clamp(&config);
                state.refill(&config, now);
                tracing::debug!(limiter = %name, tokens = state.tokens, "Restored rate limiter state");
                state
            }
            Ok(None) => RateLimiterState::full(&config, now),
            Err(e) => {
                tracing::warn!(limiter = %name, "Ignoring unreadable rate limiter state: {:#}", e);
                RateLimiterState::full(&config, now)
            }
        };

        Self {
            name,
            config,
            store: Some(store),
            inner: Mutex::new(Inner { state, version: 0 }),
            persisted: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Current token count after refilling for elapsed time.
    pub async fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        inner.state.refill(&self.config, Utc::now());
        inner.state.tokens
    }

    /// Take one token, sleeping for exactly the deficit when the bucket is empty.
    pub async fn wait_if_needed(&self) -> Result<()> {
        let (state, version) = self.take_token().await?;
        self.persist(state, version).await;
        Ok(())
    }

    async fn take_token(&self) -> Result<(RateLimiterState, u64)> {
        // The lock is held across the sleep so waiters queue in order.
        let mut inner = self.inner.lock().await;
        inner.state.refill(&self.config, Utc::now());

        if inner.state.tokens < 1.0 {
            let rate = self.config.refill_per_second();
            if rate <= 0.0 {
                anyhow::bail!("Rate limiter '{}' has a zero refill rate", self.name);
            }
            let wait = Duration::from_secs_f64((1.0 - inner.state.tokens) / rate);
            tracing::debug!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
            inner.state.refill(&self.config, Utc::now());
            // Sleep granularity can leave us a hair short of a whole token.
            inner.state.tokens = inner.state.tokens.max(1.0);
        }

        inner.state.tokens -= 1.0;
        inner.version += 1;
        Ok((inner.state, inner.version))
    }

    /// Take a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let taken = {
            let mut inner = self.inner.lock().await;
            inner.state.refill(&self.config, Utc::now());
            if inner.state.tokens >= 1.0 {
                inner.state.tokens -= 1.0;
                inner.version += 1;
                Some((inner.state, inner.version))
            } else {
                None
            }
        };
        match taken {
            Some((state, version)) => {
                self.persist(state, version).await;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> RateLimiterState {
        self.inner.lock().await.state
    }

    /// Write `state` unless a newer snapshot already reached the store.
    /// Runs outside the bucket lock.
    async fn persist(&self, state: RateLimiterState, version: u64) {
        let Some(store) = &self.store else {
            return;
        };
        let mut persisted = self.persisted.lock().await;
        if *persisted >= version {
            return;
        }
        match store.save_async(COLLECTION, &self.name, &state).await {
            Ok(()) => *persisted = version,
            Err(e) => tracing::warn!(limiter = %self.name, "Failed to persist rate limiter state: {:#}", e),
        }
    }
}

/// The pair of limiters a registry client picks from by auth state.
#[derive(Clone)]
pub struct RateLimiters {
    pub authenticated: Arc<RateLimiter>,
    pub anonymous: Arc<RateLimiter>,
}

impl RateLimiters {
    pub fn in_memory(authenticated: RateLimitConfig, anonymous: RateLimitConfig) -> Self {
        Self {
            authenticated: Arc::new(RateLimiter::new("authenticated", authenticated)),
            anonymous: Arc::new(RateLimiter::new("anonymous", anonymous)),
        }
    }

    pub fn persistent(
        authenticated: RateLimitConfig,
        anonymous: RateLimitConfig,
        store: &JsonStore,
    ) -> Self {
        Self {
            authenticated: Arc::new(RateLimiter::persistent("authenticated", authenticated, store.clone())),
            anonymous: Arc::new(RateLimiter::persistent("anonymous", anonymous, store.clone())),
        }
    }

    pub fn for_auth(&self, has_token: bool) -> &Arc<RateLimiter> {
        if has_token {
            &self.authenticated
        } else {
            &self.anonymous
        }
    }
}
