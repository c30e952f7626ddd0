use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::platform::PlatformKind;

const TIMING_HISTORY_LIMIT: usize = 100;
const ERROR_HISTORY_LIMIT: usize = 50;

/// Average connection time above this is considered slow
const SLOW_CONNECTION_MS: f64 = 5000.0;

const HEALTHY_SUCCESS_RATE: f64 = 0.8;
const HEALTHY_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Performance buckets tracked per platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PerfBucket {
    ConnectionTime,
    ServiceInitTime,
    ConfigValidationTime,
    DependencyTime,
}

/// Aggregate for one performance bucket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl BucketStats {
    fn record(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
    }

    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSample {
    pub at: DateTime<Utc>,
    pub duration_ms: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSample {
    pub at: DateTime<Utc>,
    pub message: String,
    pub error_type: String,
}

/// Severity of the recommended operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionLevel {
    Critical,
    Warning,
    Optimization,
    Error,
    Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub level: ActionLevel,
    pub message: String,
}

/// Everything tracked for one platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub prevented: u64,
    pub consecutive_failures: u32,
    pub timing_history: VecDeque<TimingSample>,
    pub error_history: VecDeque<ErrorSample>,
    pub error_counts: HashMap<String, u64>,
    pub buckets: HashMap<PerfBucket, BucketStats>,
}

impl PlatformStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.success_rate() >= HEALTHY_SUCCESS_RATE
            && self.consecutive_failures < HEALTHY_MAX_CONSECUTIVE_FAILURES
    }
}

/// Connection statistics per platform with bounded histories
pub struct StatisticsCollector {
    platforms: DashMap<PlatformKind, PlatformStats>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self {
            platforms: DashMap::new(),
        }
    }

    pub fn record_attempt(&self, platform: PlatformKind) {
        self.platforms.entry(platform).or_default().attempts += 1;
    }

    pub fn record_success(&self, platform: PlatformKind, duration_ms: f64) {
        let mut stats = self.platforms.entry(platform).or_default();
        stats.successes += 1;
        stats.consecutive_failures = 0;
        push_bounded(
            &mut stats.timing_history,
            TimingSample {
                at: Utc::now(),
                duration_ms,
                label: "connect".to_string(),
            },
            TIMING_HISTORY_LIMIT,
        );
        stats
            .buckets
            .entry(PerfBucket::ConnectionTime)
            .or_default()
            .record(duration_ms);
        debug!(platform = %platform, duration_ms, "Connection success recorded");
    }

    pub fn record_failure(&self, platform: PlatformKind, message: &str, error_type: &str) {
        let mut stats = self.platforms.entry(platform).or_default();
        stats.failures += 1;
        stats.consecutive_failures += 1;
        push_bounded(
            &mut stats.error_history,
            ErrorSample {
                at: Utc::now(),
                message: message.to_string(),
                error_type: error_type.to_string(),
            },
            ERROR_HISTORY_LIMIT,
        );
        *stats
            .error_counts
            .entry(error_type.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_prevented(&self, platform: PlatformKind) {
        self.platforms.entry(platform).or_default().prevented += 1;
    }

    pub fn record_timing(&self, platform: PlatformKind, bucket: PerfBucket, ms: f64) {
        self.platforms
            .entry(platform)
            .or_default()
            .buckets
            .entry(bucket)
            .or_default()
            .record(ms);
    }

    pub fn snapshot(&self, platform: PlatformKind) -> PlatformStats {
        self.platforms
            .get(&platform)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn all_snapshots(&self) -> HashMap<PlatformKind, PlatformStats> {
        self.platforms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn is_healthy(&self, platform: PlatformKind) -> bool {
        self.snapshot(platform).is_healthy()
    }

    /// Recommend an operator action based on failure streaks and timings
    pub fn recommended_action(&self, platform: PlatformKind) -> Recommendation {
        let stats = self.snapshot(platform);

        if stats.consecutive_failures >= 5 {
            return Recommendation {
                level: ActionLevel::Critical,
                message: format!(
                    "{} has failed {} times in a row; check credentials and connectivity",
                    platform, stats.consecutive_failures
                ),
            };
        }
        if stats.consecutive_failures >= 3 {
            return Recommendation {
                level: ActionLevel::Warning,
                message: format!(
                    "{} is failing repeatedly ({} consecutive)",
                    platform, stats.consecutive_failures
                ),
            };
        }
        let avg_connect = stats
            .buckets
            .get(&PerfBucket::ConnectionTime)
            .map(|b| b.average_ms())
            .unwrap_or(0.0);
        if avg_connect > SLOW_CONNECTION_MS {
            return Recommendation {
                level: ActionLevel::Optimization,
                message: format!(
                    "{} connections average {:.0}ms; investigate latency",
                    platform, avg_connect
                ),
            };
        }
        if stats.attempts > 0 && stats.successes == 0 {
            return Recommendation {
                level: ActionLevel::Error,
                message: format!("{} has never connected successfully", platform),
            };
        }
        Recommendation {
            level: ActionLevel::Normal,
            message: format!("{} is operating normally", platform),
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, sample: T, limit: usize) {
    if history.len() >= limit {
        history.pop_front();
    }
    history.push_back(sample);
}
