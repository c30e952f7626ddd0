use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::protocol::CloseFrame, tungstenite::protocol::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthPhase, AuthStateMachine};
use crate::error::classify_error;
use crate::events::schema::EventKind;
use crate::platform::twitch::subscriptions::SubscriptionManager;
use crate::platform::{EventSink, PlatformKind, RawPlatformEvent};
use crate::retry;

pub const DEFAULT_EVENTSUB_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WELCOME_TIMEOUT_MS: u64 = 10_000;

/// Grace added to the session's keepalive timeout before a silent socket
/// counts as dead
const KEEPALIVE_SLACK: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 600;

/// Uniform jitter added to reconnect delays, in milliseconds
const RECONNECT_JITTER_MS: u64 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Connecting,
    WelcomePending,
    Subscribing,
    Ready,
    Closing,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct EventSubConfig {
    pub ws_url: String,
    pub broadcaster_id: String,
    pub user_id: String,
    pub max_retry_attempts: u32,
    pub welcome_timeout_ms: u64,
}

impl EventSubConfig {
    pub fn new(broadcaster_id: &str, user_id: &str) -> Self {
        Self {
            ws_url: DEFAULT_EVENTSUB_URL.to_string(),
            broadcaster_id: broadcaster_id.to_string(),
            user_id: user_id.to_string(),
            max_retry_attempts: 5,
            welcome_timeout_ms: DEFAULT_WELCOME_TIMEOUT_MS,
        }
    }
}

enum FrameAction {
    Continue,
    Reconnect,
}

/// Twitch EventSub over WebSocket: session handshake, subscription setup,
/// notification dispatch, and jittered reconnects.
pub struct EventSubClient {
    config: EventSubConfig,
    subs: Arc<SubscriptionManager>,
    auth: Arc<AuthStateMachine>,
    sink: EventSink,
    state: Arc<RwLock<LifecycleState>>,
    session_id: Arc<RwLock<Option<String>>>,
    reconnect_url: Arc<RwLock<Option<String>>>,
    is_connected: Arc<AtomicBool>,
    subscriptions_ready: Arc<AtomicBool>,
    is_initialized: Arc<AtomicBool>,
    retry_attempts: Arc<AtomicU32>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<&'static str>>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventSubClient {
    pub fn new(
        config: EventSubConfig,
        subs: Arc<SubscriptionManager>,
        auth: Arc<AuthStateMachine>,
        sink: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            subs,
            auth,
            sink,
            state: Arc::new(RwLock::new(LifecycleState::Init)),
            session_id: Arc::new(RwLock::new(None)),
            reconnect_url: Arc::new(RwLock::new(None)),
            is_connected: Arc::new(AtomicBool::new(false)),
            subscriptions_ready: Arc::new(AtomicBool::new(false)),
            is_initialized: Arc::new(AtomicBool::new(false)),
            retry_attempts: Arc::new(AtomicU32::new(0)),
            shutdown_tx: Arc::new(RwLock::new(None)),
            reconnect_timer: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::SeqCst)
    }

    pub fn subscriptions_ready(&self) -> bool {
        self.subscriptions_ready.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::SeqCst)
    }

    /// Mark the client live and perform the first connection.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.is_initialized.store(true, Ordering::SeqCst);
        self.connect_websocket().await
    }

    /// Full connect sequence: socket, welcome, subscriptions, read loop.
    pub async fn connect_websocket(self: &Arc<Self>) -> Result<()> {
        *self.state.write().await = LifecycleState::Connecting;

        // A pending reconnect URL from session_reconnect takes precedence
        let url = self
            .reconnect_url
            .write()
            .await
            .take()
            .unwrap_or_else(|| self.config.ws_url.clone());
        info!(url = %url, "Connecting to EventSub WebSocket");

        let mut ws_stream = match timeout(CONNECT_TIMEOUT, connect_async(&url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(anyhow!("WebSocket connection failed: {}", e)),
            Err(_) => return Err(anyhow!("WebSocket connection timed out")),
        };

        *self.state.write().await = LifecycleState::WelcomePending;
        let (session_id, keepalive_secs) = match self.await_welcome(&mut ws_stream).await {
            Ok(welcome) => welcome,
            Err(e) => {
                let _ = ws_stream.close(None).await;
                return Err(e);
            }
        };
        *self.session_id.write().await = Some(session_id.clone());
        self.is_connected.store(true, Ordering::SeqCst);
        self.emit(
            EventKind::Connection,
            json!({ "state": "connected", "sessionId": session_id }),
        )
        .await;

        *self.state.write().await = LifecycleState::Subscribing;
        let run = self
            .subs
            .create_all(&session_id, &self.config.broadcaster_id, &self.config.user_id)
            .await;
        let throttled = run.rate_limited_types();
        if !throttled.is_empty() {
            self.emit(
                EventKind::RateLimitHit,
                json!({ "subscriptions": throttled }),
            )
            .await;
        }
        if !run.all_succeeded() {
            self.subscriptions_ready.store(false, Ordering::SeqCst);
            self.emit(
                EventKind::Error,
                json!({
                    "message": "EventSub subscription setup failed",
                    "recoverable": !run.needs_reauthorization(),
                }),
            )
            .await;
            if run.needs_reauthorization() {
                self.emit(EventKind::AuthenticationRequired, json!({})).await;
            }
            let _ = ws_stream.close(None).await;
            self.is_connected.store(false, Ordering::SeqCst);
            *self.session_id.write().await = None;
            return Err(anyhow!("EventSub subscription setup failed"));
        }
        self.subscriptions_ready.store(true, Ordering::SeqCst);
        *self.state.write().await = LifecycleState::Ready;
        self.retry_attempts.store(0, Ordering::SeqCst);
        self.emit(EventKind::ChatConnected, json!({})).await;

        let stale_after = Duration::from_secs(
            keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT_SECS),
        ) + KEEPALIVE_SLACK;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.read_loop(ws_stream, shutdown_rx, stale_after).await;
        });
        Ok(())
    }

    /// Wait for session_welcome, enforcing the welcome deadline. Returns the
    /// session id and its keepalive timeout.
    async fn await_welcome(&self, ws_stream: &mut WsStream) -> Result<(String, Option<u64>)> {
        let deadline = Duration::from_millis(self.config.welcome_timeout_ms);
        let started = std::time::Instant::now();

        while started.elapsed() < deadline {
            let remaining = deadline.saturating_sub(started.elapsed());
            match timeout(remaining.min(Duration::from_secs(1)), ws_stream.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    let frame: Value = match serde_json::from_str(text.as_str()) {
                        Ok(v) => v,
                        Err(e) => {
                            let classified = classify_error(&e.to_string(), None);
                            warn!(error = %e, category = ?classified.category, "Unparseable EventSub frame");
                            return Err(anyhow!("Invalid EventSub frame: {}", e));
                        }
                    };
                    let message_type = frame
                        .pointer("/metadata/message_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    if message_type != "session_welcome" {
                        warn!(message_type, "Non-welcome message during handshake");
                        continue;
                    }
                    let session_id = frame
                        .pointer("/payload/session/id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    if session_id.trim().is_empty() {
                        return Err(anyhow!("Welcome message carried a blank session id"));
                    }
                    let keepalive_secs = frame
                        .pointer("/payload/session/keepalive_timeout_seconds")
                        .and_then(|v| v.as_u64());
                    return Ok((session_id.to_string(), keepalive_secs));
                }
                Ok(Some(Ok(WsMessage::Close(_)))) => {
                    return Err(anyhow!(
                        "Connection closed abnormally during initial handshake"
                    ));
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(anyhow!("WebSocket error: {}", e)),
                Ok(None) => {
                    return Err(anyhow!(
                        "Connection closed abnormally during initial handshake"
                    ));
                }
                Err(_) => continue,
            }
        }
        Err(anyhow!("Connection timeout - no welcome message"))
    }

    async fn read_loop(
        self: Arc<Self>,
        mut ws_stream: WsStream,
        mut shutdown_rx: mpsc::Receiver<&'static str>,
        stale_after: Duration,
    ) {
        let mut abnormal = false;
        let mut provider_reconnect = false;
        loop {
            tokio::select! {
                // Keepalives reset this on every frame; a socket silent past
                // the session's keepalive window is treated as dead
                _ = tokio::time::sleep(stale_after) => {
                    warn!(
                        stale_after_ms = stale_after.as_millis() as u64,
                        "No frames within the keepalive window, dropping connection"
                    );
                    abnormal = true;
                    break;
                }
                reason = shutdown_rx.recv() => {
                    let reason = reason.unwrap_or("Shutdown");
                    debug!(reason, "Closing EventSub socket");
                    let _ = ws_stream
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                msg = ws_stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match self.handle_frame(text.as_str()).await {
                            FrameAction::Continue => {}
                            FrameAction::Reconnect => {
                                let _ = ws_stream
                                    .send(WsMessage::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "Reconnecting".into(),
                                    })))
                                    .await;
                                provider_reconnect = true;
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        debug!("Ping received, replying with pong");
                        if let Err(e) = ws_stream.send(WsMessage::Pong(data)).await {
                            error!(error = %e, "Failed to send pong");
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        // liveness evidence only
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        abnormal = frame
                            .as_ref()
                            .map(|f| is_abnormal_close(f.code.into()))
                            .unwrap_or(true);
                        info!(frame = ?frame, abnormal, "EventSub socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "EventSub socket error");
                        abnormal = true;
                        break;
                    }
                    None => {
                        warn!("EventSub socket ended without close frame");
                        abnormal = true;
                        break;
                    }
                }
            }
        }

        // Any close resets connection state
        self.is_connected.store(false, Ordering::SeqCst);
        self.subscriptions_ready.store(false, Ordering::SeqCst);
        *self.session_id.write().await = None;
        *self.state.write().await = LifecycleState::Disconnected;
        self.emit(EventKind::ChatDisconnected, json!({})).await;

        if provider_reconnect && self.is_initialized.load(Ordering::SeqCst) {
            // The stored reconnect URL is short-lived, so no backoff here
            Arc::clone(&self).reconnect().await;
        } else if abnormal && self.is_initialized.load(Ordering::SeqCst) {
            self.schedule_reconnect().await;
        }
    }

    async fn handle_frame(&self, text: &str) -> FrameAction {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                let classified = classify_error(&e.to_string(), None);
                warn!(error = %e, category = ?classified.category, "Dropping unparseable frame");
                return FrameAction::Continue;
            }
        };
        let message_type = frame
            .pointer("/metadata/message_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match message_type {
            "session_keepalive" => FrameAction::Continue,
            "session_reconnect" => {
                if let Some(url) = frame
                    .pointer("/payload/session/reconnect_url")
                    .and_then(|v| v.as_str())
                {
                    info!("Session reconnect requested by provider");
                    *self.reconnect_url.write().await = Some(url.to_string());
                }
                FrameAction::Reconnect
            }
            "revocation" => {
                let sub_type = frame
                    .pointer("/payload/subscription/type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let status = frame
                    .pointer("/payload/subscription/status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("revoked");
                self.subs.mark_revoked(sub_type);
                self.emit(
                    EventKind::Error,
                    json!({
                        "message": format!("EventSub subscription revoked: {} ({})", sub_type, status),
                        "recoverable": false,
                    }),
                )
                .await;
                FrameAction::Continue
            }
            "notification" => {
                let message_id = frame
                    .pointer("/metadata/message_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if message_id.is_empty() || self.subs.is_duplicate(message_id) {
                    return FrameAction::Continue;
                }
                let sub_type = frame
                    .pointer("/payload/subscription/type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let event = frame
                    .pointer("/payload/event")
                    .cloned()
                    .unwrap_or(Value::Null);
                if let Some((kind, payload)) = map_notification(sub_type, &event) {
                    self.emit(kind, payload).await;
                } else {
                    debug!(sub_type, "Ignoring unmapped notification type");
                }
                FrameAction::Continue
            }
            other => {
                debug!(message_type = other, "Ignoring EventSub frame");
                FrameAction::Continue
            }
        }
    }

    /// Back-off reconnect with jitter; exhaustion disables the client.
    pub async fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.retry_attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_retry_attempts {
            error!(attempts, "EventSub reconnect attempts exhausted");
            self.is_initialized.store(false, Ordering::SeqCst);
            self.emit(EventKind::Connection, json!({ "state": "abandoned" }))
                .await;
            return;
        }

        let delay = retry::calculate_delay(attempts)
            + Duration::from_millis(fastrand::u64(0..RECONNECT_JITTER_MS));
        info!(
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling EventSub reconnect"
        );

        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            client.reconnect().await;
        });
        let mut timer = match self.reconnect_timer.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    // Boxed so the connect/read-loop/reconnect cycle has an erased edge and
    // the spawned futures stay provably Send.
    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // Close any half-open socket; a failed close is not fatal
            if let Some(tx) = self.shutdown_tx.write().await.take() {
                let _ = tx.send("Reconnecting").await;
            }

            if self.auth.phase() != AuthPhase::Ready {
                warn!(phase = ?self.auth.phase(), "Auth not ready, aborting reconnect");
                return;
            }

            match self.connect_websocket().await {
                Ok(()) => {
                    self.retry_attempts.store(0, Ordering::SeqCst);
                    info!("EventSub reconnected");
                }
                Err(e) => {
                    let attempts = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(attempts, error = %e, "Reconnect failed");
                    self.schedule_reconnect().await;
                }
            }
        })
    }

    /// Orderly shutdown: stop the read loop and cancel pending reconnects.
    pub async fn stop(&self) {
        info!("Stopping EventSub client");
        *self.state.write().await = LifecycleState::Closing;
        self.is_initialized.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send("Shutdown").await;
        }
        let mut timer = match self.reconnect_timer.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }

    async fn emit(&self, kind: EventKind, payload: Value) {
        let event = RawPlatformEvent {
            platform: PlatformKind::Twitch,
            kind,
            payload,
        };
        if self.sink.send(event).await.is_err() {
            warn!("Event sink closed, dropping event");
        }
    }
}

/// Close codes 1000/1001 are orderly; everything else (1006, the 4000
/// range, unknowns) drives a reconnect.
fn is_abnormal_close(code: u16) -> bool {
    !matches!(code, 1000 | 1001)
}

/// Map an EventSub notification to a raw platform event for the normalizer.
fn map_notification(sub_type: &str, event: &Value) -> Option<(EventKind, Value)> {
    match sub_type {
        "channel.chat.message" => Some((
            EventKind::ChatMessage,
            json!({
                "username": event.pointer("/chatter_user_name"),
                "userId": event.pointer("/chatter_user_id"),
                "message": event.pointer("/message/text"),
            }),
        )),
        "channel.follow" => Some((
            EventKind::Follow,
            json!({
                "username": event.get("user_name"),
                "userId": event.get("user_id"),
                "followed_at": event.get("followed_at"),
            }),
        )),
        "channel.subscribe" => Some((
            EventKind::Subscription,
            json!({
                "username": event.get("user_name"),
                "userId": event.get("user_id"),
                "tier": event.get("tier"),
                "months": 1,
            }),
        )),
        "channel.subscription.gift" => Some((
            EventKind::GiftSubscription,
            json!({
                "username": event.get("user_name"),
                "userId": event.get("user_id"),
                "giftCount": event.get("total"),
                "tier": event.get("tier"),
            }),
        )),
        "channel.cheer" => Some((
            EventKind::Gift,
            json!({
                "username": event.get("user_name"),
                "userId": event.get("user_id"),
                "id": event.get("message_id"),
                "isError": event.get("message_id").is_none(),
                "bits": event.get("bits"),
            }),
        )),
        "channel.raid" => Some((
            EventKind::Raid,
            json!({
                "username": event.get("from_broadcaster_user_name"),
                "userId": event.get("from_broadcaster_user_id"),
                "viewerCount": event.get("viewers"),
            }),
        )),
        _ => None,
    }
}
