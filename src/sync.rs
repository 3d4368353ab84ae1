// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `RwLock` helpers that recover from poisoning instead of panicking.
//!
//! A panic in one download task must not take the progress watchers or the
//! secret store down with it, so a poisoned guard is logged and used anyway.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelfetch::sync",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelfetch::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering data"
            );
            poisoned.into_inner()
        }
    }
}
