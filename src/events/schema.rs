use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Platforms accepted in canonical events
pub const SUPPORTED_PLATFORMS: &[&str] = &["twitch", "youtube", "tiktok"];

/// The closed set of canonical event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ChatMessage,
    Follow,
    Subscription,
    GiftSubscription,
    Gift,
    Raid,
    Share,
    Envelope,
    ViewerCount,
    StreamStatus,
    ChatConnected,
    ChatDisconnected,
    ConnectionStatus,
    Connection,
    Notification,
    AuthenticationRequired,
    RateLimitHit,
    Error,
    HealthCheck,
    StreamDetected,
}

impl EventKind {
    pub const ALL: [EventKind; 20] = [
        EventKind::ChatMessage,
        EventKind::Follow,
        EventKind::Subscription,
        EventKind::GiftSubscription,
        EventKind::Gift,
        EventKind::Raid,
        EventKind::Share,
        EventKind::Envelope,
        EventKind::ViewerCount,
        EventKind::StreamStatus,
        EventKind::ChatConnected,
        EventKind::ChatDisconnected,
        EventKind::ConnectionStatus,
        EventKind::Connection,
        EventKind::Notification,
        EventKind::AuthenticationRequired,
        EventKind::RateLimitHit,
        EventKind::Error,
        EventKind::HealthCheck,
        EventKind::StreamDetected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChatMessage => "platform:chat-message",
            EventKind::Follow => "platform:follow",
            EventKind::Subscription => "platform:paypiggy",
            EventKind::GiftSubscription => "platform:giftpaypiggy",
            EventKind::Gift => "platform:gift",
            EventKind::Raid => "platform:raid",
            EventKind::Share => "platform:share",
            EventKind::Envelope => "platform:envelope",
            EventKind::ViewerCount => "platform:viewer-count",
            EventKind::StreamStatus => "platform:stream-status",
            EventKind::ChatConnected => "platform:chat-connected",
            EventKind::ChatDisconnected => "platform:chat-disconnected",
            EventKind::ConnectionStatus => "platform:connection-status",
            EventKind::Connection => "platform:connection",
            EventKind::Notification => "platform:notification",
            EventKind::AuthenticationRequired => "platform:authentication-required",
            EventKind::RateLimitHit => "platform:rate-limit-hit",
            EventKind::Error => "platform:error",
            EventKind::HealthCheck => "platform:health-check",
            EventKind::StreamDetected => "platform:stream-detected",
        }
    }

    pub fn from_type_str(s: &str) -> Option<EventKind> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Payload fields required for this event type, beyond the envelope
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventKind::ChatMessage => &["username", "userId", "message"],
            EventKind::Follow => &["username", "userId"],
            EventKind::Subscription => &["username", "userId", "tier", "months"],
            EventKind::GiftSubscription => &["username", "userId", "giftCount", "tier"],
            EventKind::Gift => {
                &["username", "userId", "id", "giftType", "giftCount", "amount", "currency"]
            }
            EventKind::Raid => &["username", "userId", "viewerCount"],
            EventKind::Share => &["username", "userId"],
            EventKind::Envelope => &["username", "userId"],
            EventKind::ViewerCount => &["viewerCount"],
            EventKind::StreamStatus => &["isLive"],
            EventKind::ConnectionStatus => &["status"],
            EventKind::Connection => &["state"],
            EventKind::Notification => &["message"],
            EventKind::Error => &["message"],
            EventKind::StreamDetected => &["videoId"],
            EventKind::ChatConnected
            | EventKind::ChatDisconnected
            | EventKind::AuthenticationRequired
            | EventKind::RateLimitHit
            | EventKind::HealthCheck => &[],
        }
    }

    /// Whether the normalizer substitutes wall-clock time when the source
    /// carries no timestamp
    pub fn requires_timestamp(&self) -> bool {
        !matches!(
            self,
            EventKind::ViewerCount | EventKind::ConnectionStatus | EventKind::HealthCheck
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating an event against the canonical schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self { valid: true, errors: Vec::new() }
    }

    fn fail(errors: Vec<String>) -> Self {
        Self { valid: false, errors }
    }
}

/// Schema description returned by [`event_schema`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSchema {
    pub event_type: String,
    pub required_fields: Vec<String>,
    pub requires_timestamp: bool,
}

/// The full list of supported canonical event type strings
pub fn supported_event_types() -> Vec<&'static str> {
    EventKind::ALL.iter().map(|k| k.as_str()).collect()
}

/// Introspection for a single event type
pub fn event_schema(event_type: &str) -> Option<EventSchema> {
    EventKind::from_type_str(event_type).map(|kind| EventSchema {
        event_type: kind.as_str().to_string(),
        required_fields: kind.required_fields().iter().map(|f| f.to_string()).collect(),
        requires_timestamp: kind.requires_timestamp(),
    })
}

fn field_present(event: &Value, field: &str) -> bool {
    match event.get(field) {
        None | Some(Value::Null) => false,
        Some(_) => true,
    }
}

/// Validate a canonical event against the schema.
///
/// Never panics; operates on an already-parsed JSON value, so reference
/// cycles cannot occur.
pub fn validate(event: &Value) -> ValidationResult {
    if event.is_null() {
        return ValidationResult::fail(vec!["Event is null or undefined".to_string()]);
    }

    let type_str = event.get("type").and_then(|t| t.as_str());
    let kind = match type_str.and_then(EventKind::from_type_str) {
        Some(kind) => kind,
        None => {
            return ValidationResult::fail(vec![format!(
                "Invalid event type: {}",
                type_str.unwrap_or("none")
            )]);
        }
    };

    let mut errors = Vec::new();

    match event.get("platform").and_then(|p| p.as_str()) {
        Some(p) if SUPPORTED_PLATFORMS.contains(&p) => {}
        other => {
            errors.push(format!(
                "Invalid platform: {}. Must be one of: {}",
                other.unwrap_or("none"),
                SUPPORTED_PLATFORMS.join(", ")
            ));
        }
    }

    if kind.requires_timestamp() && !field_present(event, "timestamp") {
        errors.push("Missing required field: timestamp".to_string());
    }

    let is_error_gift =
        kind == EventKind::Gift && event.get("isError").and_then(|v| v.as_bool()) == Some(true);

    for field in kind.required_fields() {
        if *field == "id" && is_error_gift {
            continue;
        }
        if !field_present(event, field) {
            errors.push(format!("Missing required field: {}", field));
        }
    }

    // Chat messages carry a wrapped message object with a text string
    if kind == EventKind::ChatMessage {
        if let Some(message) = event.get("message") {
            if !message.get("text").map(|t| t.is_string()).unwrap_or(false) {
                errors.push("Missing required field: message.text".to_string());
            }
        }
    }

    if errors.is_empty() {
        ValidationResult::ok()
    } else {
        ValidationResult::fail(errors)
    }
}
