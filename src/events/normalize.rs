use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::events::schema::EventKind;
use crate::events::timestamp;
use crate::platform::PlatformKind;

/// Errors raised while normalizing a raw platform event
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid value for field: {0}")]
    InvalidField(&'static str),
}

type NormalizeResult = Result<Value, NormalizeError>;

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn get_str(raw: &Value, field: &'static str) -> Result<String, NormalizeError> {
    match raw.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(NormalizeError::MissingField(field)),
    }
}

fn get_number(raw: &Value, field: &'static str) -> Result<Value, NormalizeError> {
    match raw.get(field) {
        Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or(NormalizeError::InvalidField(field)),
        _ => Err(NormalizeError::MissingField(field)),
    }
}

/// Resolve the display name, applying platform conventions: YouTube
/// `@`-prefixes are stripped, and `"N/A"` or blank names become anonymous
/// (null username).
fn resolve_username(platform: PlatformKind, raw: &Value) -> Result<Value, NormalizeError> {
    let name = get_str(raw, "username")?;
    let name = if platform == PlatformKind::Youtube {
        name.strip_prefix('@').unwrap_or(&name).to_string()
    } else {
        name
    };
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "N/A" {
        Ok(Value::Null)
    } else {
        Ok(Value::String(trimmed.to_string()))
    }
}

fn resolved_timestamp(platform: PlatformKind, raw: &Value, kind: EventKind) -> Option<String> {
    match timestamp::resolve(platform, raw) {
        Some(ts) => Some(ts),
        None if kind.requires_timestamp() => Some(timestamp::now_iso()),
        None => None,
    }
}

fn envelope(kind: EventKind, platform: PlatformKind, raw: &Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("type".to_string(), json!(kind.as_str()));
    map.insert("platform".to_string(), json!(platform.as_str()));
    if let Some(ts) = resolved_timestamp(platform, raw, kind) {
        map.insert("timestamp".to_string(), json!(ts));
    }
    map
}

// ---------------------------------------------------------------------------
// Per-type normalizers
// ---------------------------------------------------------------------------

/// `platform:chat-message` — message text is always wrapped as `{text}`
pub fn normalize_chat_message(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::ChatMessage, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));

    let text = match raw.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => match obj.get("text") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(NormalizeError::MissingField("message")),
        },
        _ => return Err(NormalizeError::MissingField("message")),
    };
    event.insert("message".to_string(), json!({ "text": text }));
    Ok(Value::Object(event))
}

pub fn normalize_follow(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Follow, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    Ok(Value::Object(event))
}

/// `platform:paypiggy` — paid channel subscriptions / memberships
pub fn normalize_subscription(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Subscription, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    event.insert("tier".to_string(), json!(resolve_tier(platform, raw)?));
    event.insert(
        "months".to_string(),
        get_number(raw, "months").unwrap_or(json!(1)),
    );
    Ok(Value::Object(event))
}

/// `platform:giftpaypiggy` — gifted subscriptions
pub fn normalize_gift_subscription(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::GiftSubscription, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    event.insert("giftCount".to_string(), get_number(raw, "giftCount").unwrap_or(json!(1)));
    event.insert("tier".to_string(), json!(resolve_tier(platform, raw)?));
    Ok(Value::Object(event))
}

/// `platform:gift` — virtual gifts, cheers, super-chats
pub fn normalize_gift(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Gift, platform, raw);
    let is_error = raw.get("isError").and_then(|v| v.as_bool()) == Some(true);

    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    match get_str(raw, "id") {
        Ok(id) => {
            event.insert("id".to_string(), json!(id));
        }
        Err(e) if !is_error => return Err(e),
        Err(_) => {
            event.insert("isError".to_string(), json!(true));
        }
    }
    if is_error {
        event.insert("isError".to_string(), json!(true));
    }

    event.insert("giftType".to_string(), json!(resolve_gift_type(platform, raw)?));
    event.insert("giftCount".to_string(), get_number(raw, "giftCount").unwrap_or(json!(1)));

    let (amount, currency) = resolve_amount(platform, raw)?;
    event.insert("amount".to_string(), amount);
    event.insert("currency".to_string(), json!(currency));
    Ok(Value::Object(event))
}

pub fn normalize_raid(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Raid, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    event.insert("viewerCount".to_string(), get_number(raw, "viewerCount")?);
    Ok(Value::Object(event))
}

pub fn normalize_share(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Share, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    Ok(Value::Object(event))
}

pub fn normalize_envelope_gift(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::Envelope, platform, raw);
    event.insert("username".to_string(), resolve_username(platform, raw)?);
    event.insert("userId".to_string(), json!(get_str(raw, "userId")?));
    if let Ok(coins) = get_number(raw, "coins") {
        event.insert("coins".to_string(), coins);
    }
    Ok(Value::Object(event))
}

pub fn normalize_viewer_count(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::ViewerCount, platform, raw);
    event.insert("viewerCount".to_string(), get_number(raw, "viewerCount")?);
    Ok(Value::Object(event))
}

pub fn normalize_stream_status(platform: PlatformKind, raw: &Value) -> NormalizeResult {
    let mut event = envelope(EventKind::StreamStatus, platform, raw);
    let is_live = raw
        .get("isLive")
        .and_then(|v| v.as_bool())
        .ok_or(NormalizeError::MissingField("isLive"))?;
    event.insert("isLive".to_string(), json!(is_live));
    if let Ok(title) = get_str(raw, "title") {
        event.insert("title".to_string(), json!(title));
    }
    Ok(Value::Object(event))
}

/// Build a system event (connection status, errors, health checks) in the
/// canonical shape. Extra fields are merged into the payload.
pub fn build_system_event(kind: EventKind, platform: PlatformKind, fields: Value) -> Value {
    let mut event = envelope(kind, platform, &Value::Null);
    if let Value::Object(extra) = fields {
        for (k, v) in extra {
            event.insert(k, v);
        }
    }
    Value::Object(event)
}

/// Normalize a raw event by canonical kind
pub fn normalize(kind: EventKind, platform: PlatformKind, raw: &Value) -> NormalizeResult {
    match kind {
        EventKind::ChatMessage => normalize_chat_message(platform, raw),
        EventKind::Follow => normalize_follow(platform, raw),
        EventKind::Subscription => normalize_subscription(platform, raw),
        EventKind::GiftSubscription => normalize_gift_subscription(platform, raw),
        EventKind::Gift => normalize_gift(platform, raw),
        EventKind::Raid => normalize_raid(platform, raw),
        EventKind::Share => normalize_share(platform, raw),
        EventKind::Envelope => normalize_envelope_gift(platform, raw),
        EventKind::ViewerCount => normalize_viewer_count(platform, raw),
        EventKind::StreamStatus => normalize_stream_status(platform, raw),
        other => Ok(build_system_event(other, platform, raw.clone())),
    }
}

// ---------------------------------------------------------------------------
// Platform heuristics
// ---------------------------------------------------------------------------

/// Map platform subscription levels to a canonical tier string
fn resolve_tier(platform: PlatformKind, raw: &Value) -> Result<String, NormalizeError> {
    if let Ok(tier) = get_str(raw, "tier") {
        let tier = match (platform, tier.as_str()) {
            // Twitch reports tiers as 1000/2000/3000
            (PlatformKind::Twitch, "1000") => "1".to_string(),
            (PlatformKind::Twitch, "2000") => "2".to_string(),
            (PlatformKind::Twitch, "3000") => "3".to_string(),
            _ => tier,
        };
        return Ok(tier);
    }
    // YouTube memberships carry no tier levels
    if platform == PlatformKind::Youtube {
        return Ok("1".to_string());
    }
    Err(NormalizeError::MissingField("tier"))
}

fn resolve_gift_type(platform: PlatformKind, raw: &Value) -> Result<String, NormalizeError> {
    if let Ok(t) = get_str(raw, "giftType") {
        return Ok(t);
    }
    match platform {
        // Twitch cheers arrive without an explicit gift type
        PlatformKind::Twitch if raw.get("bits").is_some() => Ok("bits".to_string()),
        PlatformKind::Youtube if raw.get("purchaseAmountMicros").is_some() => {
            Ok("superchat".to_string())
        }
        _ => Err(NormalizeError::MissingField("giftType")),
    }
}

/// Amount/currency heuristics per platform: TikTok gifts price in coins,
/// Twitch cheers in bits, YouTube super-chats in micros of real currency.
fn resolve_amount(
    platform: PlatformKind,
    raw: &Value,
) -> Result<(Value, String), NormalizeError> {
    if let Ok(amount) = get_number(raw, "amount") {
        let currency = get_str(raw, "currency").unwrap_or_else(|_| default_currency(platform));
        return Ok((amount, currency));
    }
    match platform {
        PlatformKind::Twitch => {
            let bits = get_number(raw, "bits").map_err(|_| NormalizeError::MissingField("amount"))?;
            Ok((bits, "bits".to_string()))
        }
        PlatformKind::Youtube => {
            let micros = raw
                .get("purchaseAmountMicros")
                .and_then(|v| v.as_str().and_then(|s| s.parse::<f64>().ok()).or(v.as_f64()))
                .ok_or(NormalizeError::MissingField("amount"))?;
            let amount = serde_json::Number::from_f64(micros / 1_000_000.0)
                .map(Value::Number)
                .ok_or(NormalizeError::InvalidField("purchaseAmountMicros"))?;
            let currency = get_str(raw, "currency").unwrap_or_else(|_| "USD".to_string());
            Ok((amount, currency))
        }
        PlatformKind::Tiktok => {
            let diamonds = get_number(raw, "diamondCount")
                .map_err(|_| NormalizeError::MissingField("amount"))?;
            Ok((diamonds, "coins".to_string()))
        }
    }
}

fn default_currency(platform: PlatformKind) -> String {
    match platform {
        PlatformKind::Twitch => "bits".to_string(),
        PlatformKind::Youtube => "USD".to_string(),
        PlatformKind::Tiktok => "coins".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Currency words for spoken output
// ---------------------------------------------------------------------------

const CURRENCY_WORDS: &[(&str, &str)] = &[
    ("USD", "dollars"),
    ("EUR", "euros"),
    ("GBP", "pounds"),
    ("JPY", "yen"),
    ("CAD", "Canadian dollars"),
    ("AUD", "Australian dollars"),
    ("BRL", "reais"),
    ("KRW", "won"),
    ("INR", "rupees"),
    ("MXN", "pesos"),
    ("coins", "coins"),
    ("bits", "bits"),
    ("diamonds", "diamonds"),
];

/// Spoken word for a currency code; unknown codes pass through unchanged
pub fn get_currency_word(code: &str) -> String {
    CURRENCY_WORDS
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, w)| w.to_string())
        .unwrap_or_else(|| code.to_string())
}

/// Render an amount with its currency word for spoken output
pub fn format_currency_for_tts(amount: f64, word: &str) -> String {
    if (amount - amount.trunc()).abs() < f64::EPSILON {
        format!("{} {}", amount as i64, word)
    } else {
        format!("{:.2} {}", amount, word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::schema::validate;
    use serde_json::json;

    #[test]
    fn chat_message_wraps_text() {
        let raw = json!({ "username": "u", "userId": "1", "message": "hello" });
        let event = normalize_chat_message(PlatformKind::Twitch, &raw).unwrap();
        assert_eq!(event["message"], json!({ "text": "hello" }));
        assert_eq!(event["type"], "platform:chat-message");
        assert!(validate(&event).valid);
    }

    #[test]
    fn missing_fields_name_the_field() {
        let raw = json!({ "username": "u" });
        let err = normalize_follow(PlatformKind::Twitch, &raw).unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: userId");
    }

    #[test]
    fn youtube_names_strip_at_prefix() {
        let raw = json!({ "username": "@someone", "userId": "1" });
        let event = normalize_follow(PlatformKind::Youtube, &raw).unwrap();
        assert_eq!(event["username"], "someone");
    }

    #[test]
    fn blank_and_na_names_become_anonymous() {
        for name in ["N/A", "   ", ""] {
            let raw = json!({ "username": name, "userId": "1" });
            let event = normalize_follow(PlatformKind::Youtube, &raw).unwrap();
            assert!(event["username"].is_null(), "name {:?}", name);
        }
    }

    #[test]
    fn twitch_follow_uses_followed_at() {
        let raw = json!({
            "username": "u",
            "userId": "1",
            "followed_at": "2024-01-01T00:00:00Z",
        });
        let event = normalize_follow(PlatformKind::Twitch, &raw).unwrap();
        assert_eq!(event["timestamp"], "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn tiktok_gift_matches_schema_exactly() {
        let raw = json!({
            "username": "g", "userId": "2", "id": "e1",
            "giftType": "rose", "giftCount": 1, "amount": 1, "currency": "coins",
            "common": { "createTime": 1_700_000_000i64 },
        });
        let event = normalize_gift(PlatformKind::Tiktok, &raw).unwrap();
        assert_eq!(event["timestamp"], "2023-11-14T22:13:20.000Z");
        assert_eq!(event["type"], "platform:gift");
        let result = validate(&event);
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn gift_without_id_requires_error_flag() {
        let raw = json!({
            "username": "g", "userId": "2",
            "giftType": "rose", "giftCount": 1, "amount": 1, "currency": "coins",
        });
        assert!(normalize_gift(PlatformKind::Tiktok, &raw).is_err());

        let raw_err = json!({
            "username": "g", "userId": "2", "isError": true,
            "giftType": "rose", "giftCount": 1, "amount": 1, "currency": "coins",
        });
        let event = normalize_gift(PlatformKind::Tiktok, &raw_err).unwrap();
        assert!(validate(&event).valid);
    }

    #[test]
    fn twitch_cheer_becomes_bits_gift() {
        let raw = json!({ "username": "c", "userId": "3", "id": "m9", "bits": 250 });
        let event = normalize_gift(PlatformKind::Twitch, &raw).unwrap();
        assert_eq!(event["giftType"], "bits");
        assert_eq!(event["amount"], json!(250));
        assert_eq!(event["currency"], "bits");
    }

    #[test]
    fn youtube_superchat_converts_micros() {
        let raw = json!({
            "username": "s", "userId": "4", "id": "sc1",
            "purchaseAmountMicros": "5000000", "currency": "EUR",
        });
        let event = normalize_gift(PlatformKind::Youtube, &raw).unwrap();
        assert_eq!(event["giftType"], "superchat");
        assert_eq!(event["amount"], json!(5.0));
        assert_eq!(event["currency"], "EUR");
    }

    #[test]
    fn twitch_sub_tiers_flatten() {
        let raw = json!({ "username": "u", "userId": "1", "tier": "2000", "months": 3 });
        let event = normalize_subscription(PlatformKind::Twitch, &raw).unwrap();
        assert_eq!(event["tier"], "2");
        assert_eq!(event["months"], json!(3));
        assert!(validate(&event).valid);
    }

    #[test]
    fn normalized_events_always_validate() {
        let cases: Vec<(EventKind, Value)> = vec![
            (EventKind::Follow, json!({ "username": "u", "userId": "1" })),
            (
                EventKind::Raid,
                json!({ "username": "u", "userId": "1", "viewerCount": 12 }),
            ),
            (EventKind::ViewerCount, json!({ "viewerCount": 5 })),
            (EventKind::StreamStatus, json!({ "isLive": true })),
            (
                EventKind::GiftSubscription,
                json!({ "username": "u", "userId": "1", "giftCount": 5, "tier": "1" }),
            ),
        ];
        for (kind, raw) in cases {
            let event = normalize(kind, PlatformKind::Twitch, &raw).unwrap();
            let result = validate(&event);
            assert!(result.valid, "{:?}: {:?}", kind, result.errors);
            assert_eq!(event["type"], kind.as_str());
        }
    }

    #[test]
    fn system_event_builder_validates() {
        let event = build_system_event(
            EventKind::Error,
            PlatformKind::Tiktok,
            json!({ "message": "boom", "recoverable": true }),
        );
        assert!(validate(&event).valid);
    }

    #[test]
    fn currency_words_round_trip_sensibly() {
        for (code, _) in CURRENCY_WORDS {
            let word = get_currency_word(code);
            let spoken = format_currency_for_tts(5.0, &word);
            assert!(spoken.starts_with('5'), "spoken: {}", spoken);
            assert!(spoken.len() > 2);
        }
        assert_eq!(format_currency_for_tts(2.5, "euros"), "2.50 euros");
        assert_eq!(format_currency_for_tts(3.0, "dollars"), "3 dollars");
    }
}
