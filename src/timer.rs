use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Accepted interval bounds; timers outside are created anyway but the
/// violation is recorded for health reporting
const PERIOD_MIN_MS: u64 = 100;
const PERIOD_MAX_MS: u64 = 300_000;

/// Timers alive longer than this are flagged long-running
const LONG_RUNNING: Duration = Duration::from_secs(3600);

/// Async callback invoked on every timer tick
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Metadata tracked per active timer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerInfo {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub period_ms: u64,
    pub callback_label: String,
}

/// Record of a period outside the accepted bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeViolation {
    pub name: String,
    pub period_ms: u64,
    pub at: DateTime<Utc>,
}

/// Record of a cleanup pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub cleared: usize,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

/// Health snapshot of the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerHealth {
    pub active: usize,
    pub long_running: Vec<String>,
    pub range_violations: usize,
    pub cleanups: usize,
}

struct ActiveTimer {
    info: TimerInfo,
    started: Instant,
    handle: JoinHandle<()>,
}

/// Named interval timers with replacement semantics and bulk cleanup.
///
/// Every periodic task in the system runs through this registry so that
/// shutdown can reliably stop them all.
pub struct TimerRegistry {
    timers: DashMap<String, ActiveTimer>,
    range_violations: Mutex<Vec<RangeViolation>>,
    cleanup_history: Mutex<Vec<CleanupRecord>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            timers: DashMap::new(),
            range_violations: Mutex::new(Vec::new()),
            cleanup_history: Mutex::new(Vec::new()),
        }
    }

    /// Start a named interval timer. An existing timer with the same name
    /// is replaced.
    pub fn create_interval(
        &self,
        name: &str,
        callback: TimerCallback,
        period_ms: u64,
        kind: &str,
        callback_label: &str,
    ) -> TimerInfo {
        if !(PERIOD_MIN_MS..=PERIOD_MAX_MS).contains(&period_ms) {
            warn!(name, period_ms, "Timer period outside accepted range");
            if let Ok(mut violations) = self.range_violations.lock() {
                violations.push(RangeViolation {
                    name: name.to_string(),
                    period_ms,
                    at: Utc::now(),
                });
            }
        }

        let info = TimerInfo {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            started_at: Utc::now(),
            period_ms,
            callback_label: callback_label.to_string(),
        };

        let period = Duration::from_millis(period_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately; skip it so ticks start after one period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                callback().await;
            }
        });

        let active = ActiveTimer {
            info: info.clone(),
            started: Instant::now(),
            handle,
        };
        if let Some(previous) = self.timers.insert(name.to_string(), active) {
            info!(name, "Replacing existing timer");
            previous.handle.abort();
        } else {
            debug!(name, kind, period_ms, "Timer created");
        }
        info
    }

    /// Stop and remove a timer; returns false if no timer had that name.
    pub fn clear_interval(&self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some((_, timer)) => {
                timer.handle.abort();
                debug!(name, "Timer cleared");
                true
            }
            None => false,
        }
    }

    /// Stop all timers, or only those of the given kind.
    pub fn clear_all_intervals(&self, kind: Option<&str>) -> usize {
        let names: Vec<String> = self
            .timers
            .iter()
            .filter(|entry| kind.map(|k| entry.info.kind == k).unwrap_or(true))
            .map(|entry| entry.key().clone())
            .collect();
        let mut cleared = 0;
        for name in names {
            if self.clear_interval(&name) {
                cleared += 1;
            }
        }
        info!(cleared, kind = kind.unwrap_or("all"), "Cleared timers");
        cleared
    }

    pub fn has_interval(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    pub fn get_info(&self, name: &str) -> Option<TimerInfo> {
        self.timers.get(name).map(|t| t.info.clone())
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Stop every active timer and record the pass in the cleanup history.
    pub fn cleanup(&self) -> CleanupRecord {
        let started = Instant::now();
        let cleared = self.clear_all_intervals(None);
        let record = CleanupRecord {
            cleared,
            duration_ms: started.elapsed().as_millis() as u64,
            at: Utc::now(),
        };
        if let Ok(mut history) = self.cleanup_history.lock() {
            history.push(record.clone());
        }
        record
    }

    /// Snapshot timer health: active count, long-running names, violations.
    pub fn health(&self) -> TimerHealth {
        let long_running = self
            .timers
            .iter()
            .filter(|t| t.started.elapsed() > LONG_RUNNING)
            .map(|t| t.info.name.clone())
            .collect();
        TimerHealth {
            active: self.timers.len(),
            long_running,
            range_violations: self
                .range_violations
                .lock()
                .map(|v| v.len())
                .unwrap_or(0),
            cleanups: self.cleanup_history.lock().map(|h| h.len()).unwrap_or(0),
        }
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.handle.abort();
        }
    }
}
