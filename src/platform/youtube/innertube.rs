use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::schema::EventKind;
use crate::platform::youtube::registry::LiveChatConnection;
use crate::platform::{EventSink, PlatformKind, RawPlatformEvent};

pub const DEFAULT_INNERTUBE_URL: &str = "https://www.youtube.com";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
/// Poll interval bounds; the provider's own timeoutMs hint is clamped here
const POLL_MIN_MS: u64 = 800;
const POLL_MAX_MS: u64 = 30_000;
const DEFAULT_POLL_MS: u64 = 5_000;
/// Consecutive poll failures before the connection gives up
const MAX_POLL_FAILURES: u32 = 5;

/// Page metadata needed to start polling a live chat
#[derive(Debug, Clone)]
pub struct LiveChatContext {
    pub api_key: String,
    pub client_version: String,
    pub continuation: String,
}

/// One page of live chat: the actions it carried, the continuation for the
/// next poll, and the provider's suggested wait
#[derive(Debug, Default)]
pub struct LiveChatPage {
    pub actions: Vec<Value>,
    pub next_continuation: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// InnerTube live chat API client. The base URL is injectable for tests.
pub struct InnerTubeClient {
    http: reqwest::Client,
    base_url: String,
}

impl InnerTubeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Fetch the live chat page for a video and scrape the API key, client
    /// version, and initial continuation out of the embedded config.
    pub async fn fetch_live_chat_context(&self, video_id: &str) -> Result<LiveChatContext> {
        let url = format!("{}/live_chat?is_popout=1&v={}", self.base_url, video_id);
        let response = self
            .http
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("live chat page request failed")?;
        if !response.status().is_success() {
            bail!("live chat page returned HTTP {}", response.status());
        }
        let html = response.text().await.context("live chat page read failed")?;
        debug!(video_id, bytes = html.len(), "Fetched live chat page");

        let api_key = extract_between(&html, "\"INNERTUBE_API_KEY\":\"", "\"")
            .ok_or_else(|| anyhow!("api key not found in live chat page"))?;
        let client_version =
            extract_between(&html, "\"INNERTUBE_CONTEXT_CLIENT_VERSION\":\"", "\"")
                .or_else(|| extract_between(&html, "\"clientVersion\":\"", "\""))
                .ok_or_else(|| anyhow!("client version not found in live chat page"))?;
        let continuation = extract_between(&html, "\"continuation\":\"", "\"")
            .ok_or_else(|| anyhow!("continuation not found in live chat page"))?;

        info!(video_id, client_version = %client_version, "Live chat context resolved");
        Ok(LiveChatContext {
            api_key,
            client_version,
            continuation,
        })
    }

    /// One `get_live_chat` poll with the given continuation
    pub async fn get_live_chat(
        &self,
        context: &LiveChatContext,
        continuation: &str,
    ) -> Result<LiveChatPage> {
        let url = format!(
            "{}/youtubei/v1/live_chat/get_live_chat?key={}",
            self.base_url, context.api_key
        );
        let payload = json!({
            "context": {
                "client": {
                    "clientName": "WEB",
                    "clientVersion": context.client_version,
                }
            },
            "continuation": continuation,
        });

        let response = self
            .http
            .post(&url)
            .header("User-Agent", USER_AGENT)
            .json(&payload)
            .send()
            .await
            .context("get_live_chat request failed")?;
        if !response.status().is_success() {
            bail!("get_live_chat returned HTTP {}", response.status());
        }
        let body: Value = response
            .json()
            .await
            .context("get_live_chat response was not JSON")?;

        let chat = body.pointer("/continuationContents/liveChatContinuation");
        let actions = chat
            .and_then(|c| c.get("actions"))
            .and_then(|a| a.as_array())
            .cloned()
            .unwrap_or_default();

        let continuation_data = chat
            .and_then(|c| c.get("continuations"))
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|entry| {
                entry
                    .get("invalidationContinuationData")
                    .or_else(|| entry.get("timedContinuationData"))
                    .or_else(|| entry.get("reloadContinuationData"))
            });
        let next_continuation = continuation_data
            .and_then(|d| d.get("continuation"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        let timeout_ms = continuation_data
            .and_then(|d| d.get("timeoutMs"))
            .and_then(|t| t.as_u64());

        Ok(LiveChatPage {
            actions,
            next_continuation,
            timeout_ms,
        })
    }
}

pub(crate) fn extract_between(haystack: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = haystack.find(prefix)? + prefix.len();
    let end = haystack[start..].find(suffix)? + start;
    Some(haystack[start..end].to_string())
}

// ---------------------------------------------------------------------------
// Action mapping
// ---------------------------------------------------------------------------

fn runs_text(message: &Value) -> String {
    message
        .get("runs")
        .and_then(|r| r.as_array())
        .map(|runs| {
            runs.iter()
                .filter_map(|run| {
                    run.get("text")
                        .and_then(|t| t.as_str())
                        .map(|s| s.to_string())
                        .or_else(|| {
                            run.pointer("/emoji/shortcuts/0")
                                .and_then(|s| s.as_str())
                                .map(|s| s.to_string())
                        })
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Parse a display amount like `"$5.00"` or `"CA$2.00"` into micros and a
/// currency code
fn parse_amount_text(text: &str) -> Option<(i64, String)> {
    let trimmed = text.trim();
    let digits_at = trimmed.find(|c: char| c.is_ascii_digit())?;
    let (symbol, number) = trimmed.split_at(digits_at);
    let amount: f64 = number.replace(',', "").parse().ok()?;

    let currency = match symbol.trim() {
        "$" => "USD",
        "€" => "EUR",
        "£" => "GBP",
        "¥" | "JP¥" => "JPY",
        "CA$" => "CAD",
        "A$" => "AUD",
        "₹" => "INR",
        other if !other.is_empty() => {
            let code: String = other.chars().filter(|c| c.is_ascii_alphabetic()).collect();
            return Some((
                (amount * 1_000_000.0) as i64,
                if code.is_empty() { "USD".to_string() } else { code },
            ));
        }
        _ => "USD",
    };
    Some(((amount * 1_000_000.0) as i64, currency.to_string()))
}

fn base_fields(renderer: &Value) -> Value {
    json!({
        "id": renderer.get("id").cloned().unwrap_or(Value::Null),
        "username": renderer
            .pointer("/authorName/simpleText")
            .cloned()
            .unwrap_or(Value::Null),
        "userId": renderer
            .get("authorExternalChannelId")
            .cloned()
            .unwrap_or(Value::Null),
        "timestamp_usec": renderer.get("timestampUsec").cloned().unwrap_or(Value::Null),
    })
}

/// Map one live chat action to a raw platform event, when it is a kind the
/// pipeline understands
pub fn map_action(action: &Value) -> Option<RawPlatformEvent> {
    let item = action.pointer("/addChatItemAction/item")?;

    if let Some(renderer) = item.get("liveChatTextMessageRenderer") {
        let mut payload = base_fields(renderer);
        payload["message"] = json!(runs_text(renderer.get("message").unwrap_or(&Value::Null)));
        return Some(RawPlatformEvent {
            platform: PlatformKind::Youtube,
            kind: EventKind::ChatMessage,
            payload,
        });
    }

    if let Some(renderer) = item.get("liveChatPaidMessageRenderer") {
        let mut payload = base_fields(renderer);
        let amount_text = renderer
            .pointer("/purchaseAmountText/simpleText")
            .and_then(|t| t.as_str())
            .unwrap_or_default();
        if let Some((micros, currency)) = parse_amount_text(amount_text) {
            payload["purchaseAmountMicros"] = json!(micros.to_string());
            payload["currency"] = json!(currency);
        }
        payload["giftCount"] = json!(1);
        return Some(RawPlatformEvent {
            platform: PlatformKind::Youtube,
            kind: EventKind::Gift,
            payload,
        });
    }

    if let Some(renderer) = item.get("liveChatMembershipItemRenderer") {
        return Some(RawPlatformEvent {
            platform: PlatformKind::Youtube,
            kind: EventKind::Subscription,
            payload: base_fields(renderer),
        });
    }

    if let Some(renderer) = item.get("liveChatSponsorshipsGiftPurchaseAnnouncementRenderer") {
        let header = renderer
            .pointer("/header/liveChatSponsorshipsHeaderRenderer")
            .unwrap_or(&Value::Null);
        let mut payload = base_fields(renderer);
        payload["username"] = header
            .pointer("/authorName/simpleText")
            .cloned()
            .unwrap_or(payload["username"].clone());
        let count = runs_text(header.get("primaryText").unwrap_or(&Value::Null))
            .split_whitespace()
            .find_map(|word| word.parse::<u64>().ok())
            .unwrap_or(1);
        payload["giftCount"] = json!(count);
        return Some(RawPlatformEvent {
            platform: PlatformKind::Youtube,
            kind: EventKind::GiftSubscription,
            payload,
        });
    }

    None
}

// ---------------------------------------------------------------------------
// Polling connection
// ---------------------------------------------------------------------------

/// One polling live chat connection: fetch, emit, sleep on the provider's
/// suggested interval, repeat until the continuation runs out.
pub struct InnerTubeConnection {
    client: Arc<InnerTubeClient>,
    video_id: String,
    sink: EventSink,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl InnerTubeConnection {
    pub fn new(client: Arc<InnerTubeClient>, video_id: impl Into<String>, sink: EventSink) -> Self {
        Self {
            client,
            video_id: video_id.into(),
            sink,
            task: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the poll loop. `on_ready` fires once, after the first
    /// successful poll.
    pub fn start<F>(&self, context: LiveChatContext, on_ready: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let client = self.client.clone();
        let sink = self.sink.clone();
        let video_id = self.video_id.clone();
        let stopped = self.stopped.clone();

        let handle = tokio::spawn(async move {
            let mut continuation = context.continuation.clone();
            let mut failures: u32 = 0;
            let mut on_ready = Some(on_ready);

            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                match client.get_live_chat(&context, &continuation).await {
                    Ok(page) => {
                        failures = 0;
                        if let Some(ready) = on_ready.take() {
                            ready();
                        }
                        for action in &page.actions {
                            if let Some(event) = map_action(action) {
                                if sink.send(event).await.is_err() {
                                    debug!(video_id, "Event sink closed, stopping poll loop");
                                    return;
                                }
                            }
                        }
                        match page.next_continuation {
                            Some(next) => continuation = next,
                            None => {
                                info!(video_id, "Live chat ended");
                                let _ = sink
                                    .send(RawPlatformEvent {
                                        platform: PlatformKind::Youtube,
                                        kind: EventKind::ChatDisconnected,
                                        payload: json!({ "videoId": video_id }),
                                    })
                                    .await;
                                return;
                            }
                        }
                        let wait = page
                            .timeout_ms
                            .unwrap_or(DEFAULT_POLL_MS)
                            .clamp(POLL_MIN_MS, POLL_MAX_MS);
                        tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(video_id, failures, error = %e, "Live chat poll failed");
                        if failures >= MAX_POLL_FAILURES {
                            let _ = sink
                                .send(RawPlatformEvent {
                                    platform: PlatformKind::Youtube,
                                    kind: EventKind::Error,
                                    payload: json!({
                                        "message": format!("Live chat polling failed: {}", e),
                                        "recoverable": true,
                                        "videoId": video_id,
                                    }),
                                })
                                .await;
                            return;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(DEFAULT_POLL_MS))
                            .await;
                    }
                }
            }
        });

        let mut slot = match self.task.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handle);
    }

    fn abort_task(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut slot = match self.task.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl LiveChatConnection for InnerTubeConnection {
    async fn stop(&self) -> Result<()> {
        self.abort_task();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_task();
        Ok(())
    }
}
