// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rate limiting for progress updates sent to observers.

use std::time::{Duration, Instant};

/// Default minimum spacing between forwarded updates.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(500);

/// Progress change (as a fraction) that is always forwarded.
const SIGNIFICANT_CHANGE: f64 = 0.01;

/// Decides which progress values are worth forwarding.
///
/// Start (0.0) and end (1.0) are always forwarded; anything else only when
/// the interval has passed since the last forwarded value or progress moved
/// by more than 1%.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<(f64, Instant)>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn should_forward(&mut self, progress: f64) -> bool {
        self.should_forward_at(progress, Instant::now())
    }

    pub fn should_forward_at(&mut self, progress: f64, now: Instant) -> bool {
        let forward = progress <= 0.0
            || progress >= 1.0
            || match self.last {
                None => true,
                Some((value, at)) => {
                    now.saturating_duration_since(at) >= self.interval
                        || (progress - value).abs() > SIGNIFICANT_CHANGE
                }
            };
        if forward {
            self.last = Some((progress, now));
        }
        forward
    }

    /// Forget history so the next value is forwarded. Called when a file
    /// restarts from zero and progress moves backwards.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL)
    }
}
