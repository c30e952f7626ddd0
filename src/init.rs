use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Outcome of one initialization attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone)]
struct InitState {
    initialized: bool,
    attempts: u32,
    prevented_reinitializations: u64,
    allow_reinitialization: bool,
    max_attempts: u32,
    last: Option<InitRecord>,
}

impl Default for InitState {
    fn default() -> Self {
        Self {
            initialized: false,
            attempts: 0,
            prevented_reinitializations: 0,
            allow_reinitialization: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last: None,
        }
    }
}

/// Gate around initialization attempts.
///
/// Prevents accidental re-initialization of a live platform and caps how
/// many attempts are made before operator intervention is required.
pub struct InitializationManager {
    name: String,
    state: Mutex<InitState>,
}

impl InitializationManager {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(InitState::default()),
        }
    }

    /// Ask permission to initialize. Returns true when the attempt may
    /// proceed; the attempt counter is advanced on a true return.
    pub fn begin_initialization(&self, force: bool) -> bool {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        // An initialized flag without a record means earlier state was lost
        if state.initialized && state.last.is_none() {
            warn!(name = %self.name, "Inconsistent init state, healing");
            state.initialized = false;
            state.attempts = 0;
        }

        if state.initialized && !force && !state.allow_reinitialization {
            state.prevented_reinitializations += 1;
            info!(
                name = %self.name,
                prevented = state.prevented_reinitializations,
                "Re-initialization prevented"
            );
            return false;
        }

        if state.attempts >= state.max_attempts {
            error!(
                name = %self.name,
                attempts = state.attempts,
                max = state.max_attempts,
                "Initialization attempt limit reached"
            );
            return false;
        }

        state.attempts += 1;
        true
    }

    pub fn mark_initialization_success(&self, extra: serde_json::Value) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.initialized = true;
        let attempt = state.attempts;
        state.last = Some(InitRecord {
            timestamp: Utc::now(),
            success: true,
            error: None,
            attempt,
            extra,
        });
        info!(name = %self.name, attempt, "Initialization succeeded");
    }

    pub fn mark_initialization_failure(&self, err: &str, extra: serde_json::Value) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.initialized = false;
        let attempt = state.attempts;
        state.last = Some(InitRecord {
            timestamp: Utc::now(),
            success: false,
            error: Some(err.to_string()),
            attempt,
            extra,
        });
        warn!(name = %self.name, attempt, error = err, "Initialization failed");
    }

    /// Adjust gating. Non-positive `max_attempts` values are ignored.
    pub fn configure(&self, allow_reinitialization: Option<bool>, max_attempts: Option<u32>) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(allow) = allow_reinitialization {
            state.allow_reinitialization = allow;
        }
        match max_attempts {
            Some(max) if max > 0 => state.max_attempts = max,
            Some(_) => warn!(name = %self.name, "Ignoring non-positive max_attempts"),
            None => {}
        }
    }

    /// Restore baseline: counters, flags, and the last record
    pub fn reset(&self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = InitState::default();
        info!(name = %self.name, "Initialization state reset");
    }

    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().map(|s| s.attempts).unwrap_or(0)
    }

    pub fn prevented_reinitializations(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.prevented_reinitializations)
            .unwrap_or(0)
    }

    pub fn last_record(&self) -> Option<InitRecord> {
        self.state.lock().ok().and_then(|s| s.last.clone())
    }
}
