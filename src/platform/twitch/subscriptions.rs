use dashmap::DashMap;
use lru::LruCache;
use serde_json::{json, Value};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::platform::twitch::helix::HelixClient;

/// Bound on the notification-id dedup cache
const DEDUP_CACHE_SIZE: usize = 10_000;

/// Subscriptions every chat connection needs, with their versions
pub const REQUIRED_SUBSCRIPTIONS: &[(&str, &str)] = &[
    ("channel.chat.message", "1"),
    ("channel.follow", "2"),
    ("channel.subscribe", "1"),
    ("channel.subscription.gift", "1"),
    ("channel.raid", "1"),
    ("channel.cheer", "1"),
];

/// One failed subscription creation
#[derive(Debug, Clone)]
pub struct SubscriptionFailure {
    pub sub_type: String,
    pub message: String,
    /// 401: credentials are bad, a new OAuth grant is needed
    pub is_critical: bool,
    /// 429: worth retrying after backoff
    pub is_retryable: bool,
}

/// Outcome of creating the required subscription set
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRunResult {
    pub created: Vec<String>,
    pub failures: Vec<SubscriptionFailure>,
}

impl SubscriptionRunResult {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn needs_reauthorization(&self) -> bool {
        self.failures.iter().any(|f| f.is_critical)
    }

    /// Subscription types the provider throttled (HTTP 429)
    pub fn rate_limited_types(&self) -> Vec<String> {
        self.failures
            .iter()
            .filter(|f| f.is_retryable)
            .map(|f| f.sub_type.clone())
            .collect()
    }
}

/// Creates, tracks, and tears down EventSub subscriptions for one session,
/// and de-duplicates notification deliveries.
pub struct SubscriptionManager {
    helix: Arc<HelixClient>,
    /// subscription type → provider subscription id
    active: DashMap<String, String>,
    seen_ids: Mutex<LruCache<String, ()>>,
}

impl SubscriptionManager {
    pub fn new(helix: Arc<HelixClient>) -> Self {
        let capacity = NonZeroUsize::new(DEDUP_CACHE_SIZE).expect("nonzero cache size");
        Self {
            helix,
            active: DashMap::new(),
            seen_ids: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Condition object per subscription type. Follows v2 needs a moderator,
    /// raids watch the inbound side, chat needs the reading user.
    fn condition(sub_type: &str, broadcaster_id: &str, user_id: &str) -> Value {
        match sub_type {
            "channel.chat.message" => json!({
                "broadcaster_user_id": broadcaster_id,
                "user_id": user_id,
            }),
            "channel.follow" => json!({
                "broadcaster_user_id": broadcaster_id,
                "moderator_user_id": user_id,
            }),
            "channel.raid" => json!({
                "to_broadcaster_user_id": broadcaster_id,
            }),
            _ => json!({
                "broadcaster_user_id": broadcaster_id,
            }),
        }
    }

    /// Create every required subscription against the given session.
    /// Individual failures are recorded rather than aborting the run.
    pub async fn create_all(
        &self,
        session_id: &str,
        broadcaster_id: &str,
        user_id: &str,
    ) -> SubscriptionRunResult {
        let mut result = SubscriptionRunResult::default();
        for (sub_type, version) in REQUIRED_SUBSCRIPTIONS {
            let body = json!({
                "type": sub_type,
                "version": version,
                "condition": Self::condition(sub_type, broadcaster_id, user_id),
                "transport": { "method": "websocket", "session_id": session_id },
            });
            match self.helix.create_eventsub_subscription(&body).await {
                Ok(response) => {
                    let id = response
                        .pointer("/data/0/id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    debug!(sub_type, id = %id, "Subscription created");
                    self.active.insert(sub_type.to_string(), id);
                    result.created.push(sub_type.to_string());
                }
                Err(e) => {
                    let is_critical = e.code == ErrorCode::ApiAuthenticationFailed;
                    let is_retryable = e.code == ErrorCode::ApiRateLimited;
                    warn!(
                        sub_type,
                        critical = is_critical,
                        retryable = is_retryable,
                        error = %e,
                        "Subscription creation failed"
                    );
                    result.failures.push(SubscriptionFailure {
                        sub_type: sub_type.to_string(),
                        message: e.message,
                        is_critical,
                        is_retryable,
                    });
                }
            }
        }
        info!(
            created = result.created.len(),
            failed = result.failures.len(),
            "Subscription setup finished"
        );
        result
    }

    /// Check-and-record a notification message id. Returns true when the id
    /// was already seen and the notification must be dropped.
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let mut cache = match self.seen_ids.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cache.contains(message_id) {
            debug!(message_id, "Duplicate notification dropped");
            return true;
        }
        cache.put(message_id.to_string(), ());
        false
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drop the local record for a subscription the provider revoked.
    /// Returns the provider id if one was tracked.
    pub fn mark_revoked(&self, sub_type: &str) -> Option<String> {
        let removed = self.active.remove(sub_type).map(|(_, id)| id);
        if removed.is_some() {
            warn!(sub_type, "Subscription revoked by provider");
        }
        removed
    }

    /// Delete every subscription bound to the session (or, with None, every
    /// websocket-transport subscription). Per-id failures are logged and
    /// skipped so one bad delete never strands the rest.
    pub async fn delete_all(&self, session_id: Option<&str>) -> usize {
        let listing = match self.helix.list_eventsub_subscriptions().await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Could not list subscriptions for cleanup");
                return 0;
            }
        };

        let mut deleted = 0;
        let subs = listing
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        for sub in subs {
            let matches = match session_id {
                Some(session) => {
                    sub.pointer("/transport/session_id").and_then(|v| v.as_str())
                        == Some(session)
                }
                None => {
                    sub.pointer("/transport/method").and_then(|v| v.as_str())
                        == Some("websocket")
                }
            };
            if !matches {
                continue;
            }
            let (id, sub_type) = match (
                sub.get("id").and_then(|v| v.as_str()),
                sub.get("type").and_then(|v| v.as_str()),
            ) {
                (Some(id), Some(t)) => (id, t),
                _ => continue,
            };
            match self.helix.delete_eventsub_subscription(id).await {
                Ok(()) => {
                    self.active.remove(sub_type);
                    deleted += 1;
                }
                Err(e) => {
                    warn!(id, sub_type, error = %e, "Subscription delete failed");
                }
            }
        }
        info!(deleted, "Subscription cleanup finished");
        deleted
    }
}
