use dashmap::DashMap;
use futures::future::BoxFuture;
use std::fmt::Display;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::platform::PlatformKind;

/// Backoff parameters for reconnect scheduling
pub const BASE_DELAY_MS: u64 = 2000;
pub const BACKOFF_MULTIPLIER: f64 = 1.3;
pub const MAX_DELAY_MS: u64 = 60_000;

/// Error substrings that mean retrying is pointless without new credentials
const UNAUTHORIZED_PATTERNS: &[&str] = &[
    "401",
    "unauthorized",
    "client id and oauth token do not match",
];

/// Delay before the given attempt number (0-based), capped at the maximum
pub fn calculate_delay(attempt: u32) -> Duration {
    let delay = BASE_DELAY_MS as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32);
    Duration::from_millis((delay as u64).min(MAX_DELAY_MS))
}

/// Whether an error message indicates rejected credentials
pub fn is_unauthorized(message: &str) -> bool {
    let lower = message.to_lowercase();
    UNAUTHORIZED_PATTERNS.iter().any(|p| lower.contains(p))
}

/// What to do after a connection failure
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// Credentials rejected; clean up and stop retrying
    Stop,
    /// Schedule a reconnect after the given delay
    Retry { attempt: u32, delay: Duration },
}

/// Per-platform reconnect scheduling with exponential backoff.
///
/// At most one reconnect timer is pending per platform; scheduling a new one
/// replaces the old. The connectivity guard runs at fire-time so a reconnect
/// that became unnecessary is skipped.
pub struct RetryScheduler {
    attempts: DashMap<PlatformKind, u32>,
    pending: DashMap<PlatformKind, JoinHandle<()>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn attempts(&self, platform: PlatformKind) -> u32 {
        self.attempts.get(&platform).map(|a| *a).unwrap_or(0)
    }

    /// Classify a connection failure and, unless it is an authorization
    /// failure, advance the backoff counter.
    pub fn record_failure(&self, platform: PlatformKind, error: &str) -> FailureDisposition {
        if is_unauthorized(error) {
            warn!(platform = %platform, error, "Authorization failure, stopping retries");
            return FailureDisposition::Stop;
        }
        let mut counter = self.attempts.entry(platform).or_insert(0);
        let attempt = *counter;
        *counter += 1;
        let delay = calculate_delay(attempt);
        debug!(
            platform = %platform,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Connection failure recorded"
        );
        FailureDisposition::Retry { attempt, delay }
    }

    /// Reset the counter and cancel any pending reconnect after a successful
    /// connection.
    pub fn record_success(&self, platform: PlatformKind) {
        self.attempts.remove(&platform);
        self.cancel(platform);
    }

    /// Schedule a reconnect, replacing any pending timer for this platform.
    /// `is_connected` is consulted when the timer fires; if the platform came
    /// back on its own the reconnect is skipped.
    pub fn schedule_reconnect<G, F>(
        &self,
        platform: PlatformKind,
        delay: Duration,
        is_connected: G,
        reconnect: F,
    ) where
        G: Fn() -> bool + Send + 'static,
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.cancel(platform);
        info!(
            platform = %platform,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if is_connected() {
                debug!(platform = %platform, "Already connected, skipping reconnect");
                return;
            }
            reconnect().await;
        });
        self.pending.insert(platform, handle);
    }

    /// Cancel a pending reconnect; returns true if one existed.
    pub fn cancel(&self, platform: PlatformKind) -> bool {
        match self.pending.remove(&platform) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let platforms: Vec<PlatformKind> = self.pending.iter().map(|e| *e.key()).collect();
        for platform in platforms {
            self.cancel(platform);
        }
    }

    pub fn has_pending(&self, platform: PlatformKind) -> bool {
        self.pending.contains_key(&platform)
    }

    /// Run `operation` until it succeeds, backing off between attempts.
    /// `max_attempts == 0` means unlimited. Authorization failures abort
    /// immediately regardless of the attempt budget.
    pub async fn execute_with_retry<T, E, F>(
        &self,
        platform: PlatformKind,
        operation: F,
        max_attempts: u32,
    ) -> Result<T, E>
    where
        F: Fn(u32) -> BoxFuture<'static, Result<T, E>> + Send + Sync,
        E: Display + Send,
        T: Send,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(platform = %platform, attempt = attempt + 1, "Succeeded after retries");
                    }
                    self.record_success(platform);
                    return Ok(value);
                }
                Err(e) => {
                    if is_unauthorized(&e.to_string()) {
                        error!(platform = %platform, error = %e, "Not retryable, aborting");
                        return Err(e);
                    }
                    attempt += 1;
                    if max_attempts != 0 && attempt >= max_attempts {
                        error!(
                            platform = %platform,
                            attempts = attempt,
                            error = %e,
                            "Giving up after max attempts"
                        );
                        return Err(e);
                    }
                    let delay = calculate_delay(attempt - 1);
                    warn!(
                        platform = %platform,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().abort();
        }
    }
}
