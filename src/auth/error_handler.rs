use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::refresh::RefreshFailure;

const DEFAULT_RATE_LIMIT_RETRY_SECS: u64 = 60;

/// Messages matching any of these indicate the refresh token itself is bad
const REFRESH_TOKEN_PATTERNS: &[&str] = &[
    "invalid refresh token",
    "refresh token is invalid",
    "refresh_token is not valid",
];

/// What went wrong with a token refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshErrorKind {
    TokenLimitExceeded,
    InvalidRefreshToken,
    ExpiredRefreshToken,
    RateLimited,
    NetworkError,
    ServerError,
    Unknown,
}

/// Analysis of a refresh failure: terminal failures need a new OAuth grant,
/// recoverable ones can be retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshErrorAnalysis {
    pub kind: RefreshErrorKind,
    pub recoverable: bool,
    pub requires_oauth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Classify a refresh failure. Rules are evaluated in a fixed order; the
/// first match wins.
pub fn analyze_refresh_failure(failure: &RefreshFailure) -> RefreshErrorAnalysis {
    let message = failure.message.to_lowercase();
    let error = failure.error.as_deref().map(str::to_lowercase);

    let analysis = if message.contains("50 valid access tokens") {
        // Provider-side cap on concurrent tokens; only a fresh grant clears it
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::TokenLimitExceeded,
            recoverable: false,
            requires_oauth: true,
            retry_after_secs: None,
        }
    } else if error.as_deref() == Some("invalid_grant") {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::InvalidRefreshToken,
            recoverable: false,
            requires_oauth: true,
            retry_after_secs: None,
        }
    } else if failure.status == Some(400)
        && message.contains("invalid refresh token")
        && error.is_none()
    {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::ExpiredRefreshToken,
            recoverable: false,
            requires_oauth: true,
            retry_after_secs: None,
        }
    } else if failure.status == Some(400)
        || REFRESH_TOKEN_PATTERNS.iter().any(|p| message.contains(p))
    {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::InvalidRefreshToken,
            recoverable: false,
            requires_oauth: true,
            retry_after_secs: None,
        }
    } else if failure.status == Some(401)
        || error.as_deref() == Some("unauthorized")
        || message.contains("token has been revoked")
    {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::ExpiredRefreshToken,
            recoverable: false,
            requires_oauth: true,
            retry_after_secs: None,
        }
    } else if failure.status == Some(429) {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::RateLimited,
            recoverable: true,
            requires_oauth: false,
            retry_after_secs: Some(failure.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_RETRY_SECS)),
        }
    } else if matches!(failure.code.as_deref(), Some("ECONNREFUSED") | Some("ETIMEDOUT")) {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::NetworkError,
            recoverable: true,
            requires_oauth: false,
            retry_after_secs: None,
        }
    } else if failure.status.map_or(false, |s| s >= 500) {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::ServerError,
            recoverable: false,
            requires_oauth: false,
            retry_after_secs: None,
        }
    } else {
        RefreshErrorAnalysis {
            kind: RefreshErrorKind::Unknown,
            recoverable: true,
            requires_oauth: false,
            retry_after_secs: None,
        }
    };

    debug!(kind = ?analysis.kind, recoverable = analysis.recoverable, "Refresh failure analyzed");
    analysis
}

/// Whether and when to retry a failed refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub should_retry: bool,
    pub delay_ms: u64,
}

/// Rate limits wait out the provider's window, network errors back off
/// exponentially, everything else linearly.
pub fn create_retry_strategy(
    analysis: &RefreshErrorAnalysis,
    attempt: u32,
    max_attempts: u32,
) -> RetryStrategy {
    if !analysis.recoverable || attempt >= max_attempts {
        return RetryStrategy {
            should_retry: false,
            delay_ms: 0,
        };
    }
    let delay_ms = match analysis.kind {
        RefreshErrorKind::RateLimited => {
            analysis
                .retry_after_secs
                .unwrap_or(DEFAULT_RATE_LIMIT_RETRY_SECS)
                * 1000
        }
        RefreshErrorKind::NetworkError => 2u64.pow(attempt + 1) * 1000,
        _ => (attempt as u64 + 1) * 1000,
    };
    RetryStrategy {
        should_retry: true,
        delay_ms,
    }
}
