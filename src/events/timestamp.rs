use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

// Magnitude cutoffs for disambiguating epoch units
const SECONDS_MAX: i64 = 1_000_000_000_000; // values below this are seconds
const MICROS_MIN: i64 = 1_000_000_000_000_000; // values above this are microseconds

/// Render a UTC instant as ISO-8601 with millisecond precision
pub fn to_iso_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current wall-clock time in the canonical format
pub fn now_iso() -> String {
    to_iso_millis(Utc::now())
}

fn from_epoch_millis(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms).single().map(to_iso_millis)
}

/// Convert an epoch number of unknown unit, detecting by magnitude:
/// below 10^12 it is seconds, above 10^15 microseconds, otherwise millis.
fn from_epoch_auto(value: i64) -> Option<String> {
    if value <= 0 {
        return None;
    }
    let ms = if value < SECONDS_MAX {
        value.checked_mul(1000)?
    } else if value > MICROS_MIN {
        value / 1000
    } else {
        value
    };
    from_epoch_millis(ms)
}

fn from_epoch_micros(value: i64) -> Option<String> {
    if value <= 0 {
        return None;
    }
    from_epoch_millis(value / 1000)
}

/// Parse a JSON value holding either an epoch number (unit auto-detected),
/// a numeric string, or an ISO-8601 string. Strings are trimmed first.
fn parse_flexible(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch_auto),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(to_iso_millis(parsed.with_timezone(&Utc)));
            }
            trimmed.parse::<i64>().ok().and_then(from_epoch_auto)
        }
        _ => None,
    }
}

fn parse_micros_field(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch_micros),
        Value::String(s) => s.trim().parse::<i64>().ok().and_then(from_epoch_micros),
        _ => None,
    }
}

/// TikTok WebCast timestamps, in priority order: `common.createTime`
/// (seconds or microseconds), `common.clientSendTime` (millis or string),
/// then a top-level `timestamp` (ISO or numeric).
pub fn resolve_tiktok(raw: &Value) -> Option<String> {
    let common = raw.get("common");
    if let Some(ts) = common.and_then(|c| c.get("createTime")).and_then(parse_flexible) {
        return Some(ts);
    }
    if let Some(ts) = common.and_then(|c| c.get("clientSendTime")).and_then(parse_flexible) {
        return Some(ts);
    }
    raw.get("timestamp").and_then(parse_flexible)
}

/// YouTube timestamps: `timestamp_usec` at the top level or nested under
/// `item`, else a `timestamp` fallback (millis or ISO).
pub fn resolve_youtube(raw: &Value) -> Option<String> {
    if let Some(ts) = raw.get("timestamp_usec").and_then(parse_micros_field) {
        return Some(ts);
    }
    if let Some(ts) = raw
        .get("item")
        .and_then(|i| i.get("timestamp_usec"))
        .and_then(parse_micros_field)
    {
        return Some(ts);
    }
    raw.get("timestamp").and_then(parse_flexible)
}

/// Twitch timestamps, in priority order: `followed_at`, `started_at`,
/// `timestamp`; each parseable as ISO or numeric milliseconds.
pub fn resolve_twitch(raw: &Value) -> Option<String> {
    for field in ["followed_at", "started_at", "timestamp"] {
        if let Some(ts) = raw.get(field).and_then(parse_flexible) {
            return Some(ts);
        }
    }
    None
}

/// Resolve a raw event's timestamp for the given platform
pub fn resolve(platform: crate::platform::PlatformKind, raw: &Value) -> Option<String> {
    use crate::platform::PlatformKind;
    match platform {
        PlatformKind::Twitch => resolve_twitch(raw),
        PlatformKind::Youtube => resolve_youtube(raw),
        PlatformKind::Tiktok => resolve_tiktok(raw),
    }
}
