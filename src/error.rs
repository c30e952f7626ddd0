use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error type for the polychat core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolychatError {
    /// Error code for programmatic handling
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional context for additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Severity level
    pub severity: ErrorSeverity,
    /// Error category for retry policies and handling strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl PolychatError {
    /// Create a new error builder with the specified error code
    pub fn new(code: ErrorCode) -> PolychatErrorBuilder {
        PolychatErrorBuilder {
            code,
            message: String::new(),
            context: None,
            severity: ErrorSeverity::Error,
            category: None,
        }
    }

    /// Shorthand for an internal error with just a message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal)
            .message(message)
            .category(ErrorCategory::Internal)
            .build()
    }
}

/// Builder for creating PolychatError instances
pub struct PolychatErrorBuilder {
    code: ErrorCode,
    message: String,
    context: Option<String>,
    severity: ErrorSeverity,
    category: Option<ErrorCategory>,
}

impl PolychatErrorBuilder {
    /// Set the error message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the error context
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the error category
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Build the final PolychatError
    pub fn build(self) -> PolychatError {
        PolychatError {
            code: self.code,
            message: self.message,
            context: self.context,
            severity: self.severity,
            category: self.category,
        }
    }
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // General errors
    Unknown,
    Internal,

    // Platform driver errors
    PlatformNotFound,
    PlatformConnectionFailed,
    PlatformDisconnectFailed,
    PlatformDisabled,

    // Event bus and schema errors
    EventBusPublishFailed,
    EventValidationFailed,
    EventNormalizationFailed,

    // WebSocket errors
    WebSocketConnectFailed,
    WebSocketClosed,
    WebSocketSendFailed,

    // API errors
    ApiRequestFailed,
    ApiRateLimited,
    ApiAuthenticationFailed,

    // Authentication errors
    AuthTokenExpired,
    AuthTokenInvalid,
    AuthTokenRevoked,
    AuthRefreshFailed,
    AuthStateError,
    OAuthFlowFailed,

    // Network errors
    NetworkTimeout,
    NetworkConnectionLost,

    // Configuration errors
    ConfigInvalid,
    ConfigMissing,
}

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Informational messages that don't impact functionality
    Info,
    /// Warnings that might impact functionality but don't stop operation
    Warning,
    /// Errors that impact functionality but allow continued operation
    Error,
    /// Critical errors that prevent the application from functioning properly
    Critical,
}

/// Error categories for retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary network issues, timeouts - retryable
    Network,
    /// Authentication failures that might be fixed by token refresh
    Authentication,
    /// API rate limiting - retryable with backoff
    RateLimit,
    /// API service unavailable - retryable with longer backoff
    ServiceUnavailable,
    /// Permission denied - not retryable without reconfiguration
    Permission,
    /// Configuration errors - not retryable without reconfiguration
    Configuration,
    /// Internal errors - generally not retryable
    Internal,
    /// Validation errors - not retryable without input changes
    Validation,
}

impl ErrorCategory {
    /// Returns true if errors in this category are generally retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Authentication | Self::RateLimit | Self::ServiceUnavailable
        )
    }
}

impl fmt::Display for PolychatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{:?}: {} ({})", self.code, self.message, context)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for PolychatError {}

/// Result alias used across the crate for structured errors
pub type PolychatResult<T> = Result<T, PolychatError>;

/// Error for a failed event bus publish
pub fn event_bus_publish_failed(err: impl fmt::Display) -> PolychatError {
    PolychatError::new(ErrorCode::EventBusPublishFailed)
        .message(format!("Failed to publish event: {}", err))
        .category(ErrorCategory::Internal)
        .build()
}

// ---------------------------------------------------------------------------
// Platform error classifier
// ---------------------------------------------------------------------------

/// Classification categories for raw platform errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedCategory {
    Authentication,
    Network,
    Api,
    HttpAuth,
    Unknown,
}

/// Result of classifying a raw error value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub category: ClassifiedCategory,
    pub is_auth_error: bool,
    pub is_network_error: bool,
    pub is_api_error: bool,
    pub is_refreshable: bool,
}

const AUTH_PATTERNS: &[&str] = &[
    "401",
    "unauthorized",
    "invalid token",
    "token expired",
    "token has been revoked",
    "invalid_grant",
    "oauth",
    "authentication",
];

const NETWORK_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "network",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "dns",
];

const API_PATTERNS: &[&str] = &[
    "rate limit",
    "429",
    "500",
    "502",
    "503",
    "bad gateway",
    "service unavailable",
    "internal server error",
    "api",
];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify a raw error message and optional HTTP status.
///
/// Pattern matching is case-insensitive. `is_refreshable` is true when any
/// of the auth/network/api categories hit, or when the status is 401 or 403.
pub fn classify_error(message: &str, status_code: Option<u16>) -> ErrorClassification {
    let lowered = message.to_lowercase();

    let is_auth_error = matches_any(&lowered, AUTH_PATTERNS)
        || matches!(status_code, Some(401) | Some(403));
    let is_network_error = matches_any(&lowered, NETWORK_PATTERNS);
    let is_api_error = matches_any(&lowered, API_PATTERNS);

    let category = if matches!(status_code, Some(401) | Some(403)) {
        ClassifiedCategory::HttpAuth
    } else if is_auth_error {
        ClassifiedCategory::Authentication
    } else if is_network_error {
        ClassifiedCategory::Network
    } else if is_api_error {
        ClassifiedCategory::Api
    } else {
        ClassifiedCategory::Unknown
    };

    let is_refreshable = is_auth_error
        || is_network_error
        || is_api_error
        || matches!(status_code, Some(401) | Some(403));

    ErrorClassification {
        message: message.to_string(),
        status_code,
        category,
        is_auth_error,
        is_network_error,
        is_api_error,
        is_refreshable,
    }
}

/// Classify an error carried as a JSON value (object-like or plain string).
///
/// Objects contribute `message` and any of `status`, `statusCode`, or a
/// nested `response.status` as the HTTP status.
pub fn classify_value(value: &serde_json::Value) -> ErrorClassification {
    match value {
        serde_json::Value::String(s) => classify_error(s, None),
        serde_json::Value::Object(obj) => {
            let message = obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| value.to_string());
            let status = obj
                .get("status")
                .or_else(|| obj.get("statusCode"))
                .or_else(|| obj.get("response").and_then(|r| r.get("status")))
                .and_then(|s| s.as_u64())
                .map(|s| s as u16);
            classify_error(&message, status)
        }
        other => classify_error(&other.to_string(), None),
    }
}

// ---------------------------------------------------------------------------
// User-facing failure messages
// ---------------------------------------------------------------------------

/// A user-readable rendering of a technical failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserFacingMessage {
    pub title: String,
    pub message: String,
    pub action: String,
    pub severity: ErrorSeverity,
    pub category: String,
}

struct MessageRule {
    pattern: &'static str,
    title: &'static str,
    message: &'static str,
    action: &'static str,
    severity: ErrorSeverity,
    category: &'static str,
}

const MESSAGE_RULES: &[MessageRule] = &[
    MessageRule {
        pattern: "invalid refresh token",
        title: "Sign-In Expired",
        message: "Your saved sign-in is no longer valid.",
        action: "Sign in to the platform again.",
        severity: ErrorSeverity::Error,
        category: "authentication",
    },
    MessageRule {
        pattern: "50 valid access tokens",
        title: "Too Many Sign-Ins",
        message: "This account has reached the platform's limit of active sign-ins.",
        action: "Sign out from unused devices, then sign in again.",
        severity: ErrorSeverity::Error,
        category: "authentication",
    },
    MessageRule {
        pattern: "rate limit",
        title: "Slow Down",
        message: "The platform is limiting requests right now.",
        action: "Wait a minute; the connection retries automatically.",
        severity: ErrorSeverity::Warning,
        category: "rate_limit",
    },
    MessageRule {
        pattern: "connection timeout",
        title: "Connection Timed Out",
        message: "The platform did not respond in time.",
        action: "Check your internet connection; reconnection is automatic.",
        severity: ErrorSeverity::Warning,
        category: "network",
    },
    MessageRule {
        pattern: "subscription setup failed",
        title: "Event Subscription Failed",
        message: "Connected to the platform, but could not subscribe to events.",
        action: "Verify the account permissions and try reconnecting.",
        severity: ErrorSeverity::Error,
        category: "api",
    },
    MessageRule {
        pattern: "authentication is in error state",
        title: "Sign-In Problem",
        message: "Authentication has failed and needs attention.",
        action: "Sign in to the platform again.",
        severity: ErrorSeverity::Error,
        category: "authentication",
    },
    MessageRule {
        pattern: "econnrefused",
        title: "Connection Refused",
        message: "Could not reach the platform's servers.",
        action: "Check your internet connection or firewall.",
        severity: ErrorSeverity::Warning,
        category: "network",
    },
];

/// Map a technical error string to user-facing guidance.
///
/// Unrecognized strings resolve to a generic "Unexpected Problem".
pub fn user_facing_message(technical: &str) -> UserFacingMessage {
    let lowered = technical.to_lowercase();
    for rule in MESSAGE_RULES {
        if lowered.contains(rule.pattern) {
            return UserFacingMessage {
                title: rule.title.to_string(),
                message: rule.message.to_string(),
                action: rule.action.to_string(),
                severity: rule.severity,
                category: rule.category.to_string(),
            };
        }
    }
    UserFacingMessage {
        title: "Unexpected Problem".to_string(),
        message: technical.to_string(),
        action: "Check the logs for details.".to_string(),
        severity: ErrorSeverity::Error,
        category: "unknown".to_string(),
    }
}
