//! Per-client login attempt limiting.
//!
//! Each client identity gets a fixed budget of failed login attempts per
//! window. The window opens at the first counted failure and the budget is
//! restored in full once it has elapsed. Successful logins cost nothing.
//!
//! # Example
//!
//! ```rust
//! use statushub_server::rate_limit::{RateLimiter, RateLimitResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::with_defaults();
//!
//!     match limiter.check("203.0.113.7").await {
//!         RateLimitResult::Allowed => {
//!             // Verify the password; on failure:
//!             limiter.reject("203.0.113.7").await;
//!         }
//!         RateLimitResult::Limited { retry_after_secs } => {
//!             // Return 429 Too Many Requests with Retry-After header
//!         }
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Default length of an attempt window (30 minutes).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Default number of failed attempts allowed per window.
pub const DEFAULT_ATTEMPTS: u32 = 200;

/// How often the background task sweeps expired windows.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The attempt may proceed.
    Allowed,

    /// The client's budget is exhausted.
    Limited {
        /// Seconds until the current window ends, at least 1.
        retry_after_secs: u64,
    },
}

impl RateLimitResult {
    /// Returns `true` if the attempt is allowed.
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns `true` if the attempt is rate limited.
    #[inline]
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Returns the retry-after delay if rate limited.
    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// Failed attempts recorded for one identity in the current window.
#[derive(Debug, Clone)]
struct AttemptWindow {
    failures: u32,
    started: Instant,
}

impl AttemptWindow {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            started: now,
        }
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.started) >= window
    }

    fn remaining(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.started))
    }
}

/// Thread-safe login limiter keyed by client identity.
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<RwLock<RateLimiterInner>>,
}

#[derive(Debug)]
struct RateLimiterInner {
    windows: HashMap<String, AttemptWindow>,
    window: Duration,
    attempts: u32,
}

impl RateLimiter {
    /// Creates a limiter allowing `attempts` failures per `window`.
    pub fn new(window: Duration, attempts: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RateLimiterInner {
                windows: HashMap::new(),
                window,
                attempts,
            })),
        }
    }

    /// Creates a limiter with [`DEFAULT_WINDOW`] and [`DEFAULT_ATTEMPTS`].
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_ATTEMPTS)
    }

    /// Checks whether `identity` may attempt a login.
    pub async fn check(&self, identity: &str) -> RateLimitResult {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let Some(entry) = inner.windows.get(identity) else {
            return RateLimitResult::Allowed;
        };
        if entry.is_expired(now, inner.window) || entry.failures < inner.attempts {
            return RateLimitResult::Allowed;
        }

        let remaining = entry.remaining(now, inner.window);
        let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        RateLimitResult::Limited {
            retry_after_secs: retry_after_secs.max(1),
        }
    }

    /// Returns `true` if `identity` may attempt a login.
    pub async fn allow(&self, identity: &str) -> bool {
        self.check(identity).await.is_allowed()
    }

    /// Records a failed login attempt for `identity`.
    pub async fn reject(&self, identity: &str) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let window = inner.window;

        let entry = inner
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| AttemptWindow::new(now));
        if entry.is_expired(now, window) {
            *entry = AttemptWindow::new(now);
        }
        entry.failures = entry.failures.saturating_add(1);
    }

    /// Removes windows that have elapsed.
    ///
    /// # Returns
    ///
    /// The number of entries removed.
    pub async fn cleanup_stale_entries(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let window = inner.window;
        let initial_count = inner.windows.len();

        inner
            .windows
            .retain(|_, entry| !entry.is_expired(now, window));

        initial_count - inner.windows.len()
    }

    /// Returns the number of identities with an open window.
    pub async fn source_count(&self) -> usize {
        self.inner.read().await.windows.len()
    }

    /// Spawns a background task that sweeps elapsed windows every
    /// `cleanup_interval`.
    ///
    /// The task runs until aborted.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = limiter.cleanup_stale_entries().await;
                if removed > 0 {
                    debug!(
                        removed_count = removed,
                        "Cleaned up stale login rate limit entries"
                    );
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_defaults()
    }
}
