use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
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

use crate::events::schema::EventKind;
use crate::platform::{EventSink, PlatformDriver, PlatformKind, RawPlatformEvent};
use crate::retry;

pub const DEFAULT_WEBCAST_URL: &str = "wss://webcast.tiktok.com/webcast/im/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_MS: u64 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiktokConfig {
    pub enabled: bool,
    /// TikTok username (unique_id) whose live room to join
    pub username: Option<String>,
    pub webcast_url: String,
    pub max_retry_attempts: u32,
}

impl Default for TiktokConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: None,
            webcast_url: DEFAULT_WEBCAST_URL.to_string(),
            max_retry_attempts: 5,
        }
    }
}

enum FrameAction {
    Continue,
    Close { abnormal: bool },
}

/// WebCast live event stream over WebSocket. No auth handshake; the socket
/// starts delivering room events as soon as it opens.
pub struct WebcastClient {
    config: TiktokConfig,
    sink: EventSink,
    is_connected: Arc<AtomicBool>,
    is_initialized: Arc<AtomicBool>,
    retry_attempts: Arc<AtomicU32>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<&'static str>>>>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
}

impl WebcastClient {
    pub fn new(config: TiktokConfig, sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink,
            is_connected: Arc::new(AtomicBool::new(false)),
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

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::SeqCst)
    }

    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.is_initialized.store(true, Ordering::SeqCst);
        self.connect().await
    }

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or_else(|| anyhow!("TikTok username is not configured"))?;
        let url = webcast_url(&self.config.webcast_url, username)?;
        info!(username, "Connecting to WebCast stream");

        let ws_stream = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Err(anyhow!("WebCast connection failed: {}", e)),
            Err(_) => return Err(anyhow!("WebCast connection timed out")),
        };

        self.is_connected.store(true, Ordering::SeqCst);
        self.retry_attempts.store(0, Ordering::SeqCst);
        self.emit(EventKind::Connection, json!({ "state": "connected" }))
            .await;
        self.emit(EventKind::ChatConnected, json!({ "username": username }))
            .await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.read_loop(ws_stream, shutdown_rx).await;
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut ws_stream: WsStream,
        mut shutdown_rx: mpsc::Receiver<&'static str>,
    ) {
        let mut abnormal = false;
        loop {
            tokio::select! {
                reason = shutdown_rx.recv() => {
                    let reason = reason.unwrap_or("Shutdown");
                    debug!(reason, "Closing WebCast socket");
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
                            FrameAction::Close { abnormal: a } => {
                                abnormal = a;
                                let _ = ws_stream
                                    .send(WsMessage::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "Stream ended".into(),
                                    })))
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_stream.send(WsMessage::Pong(data)).await {
                            error!(error = %e, "Failed to send pong");
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        abnormal = frame
                            .as_ref()
                            .map(|f| is_abnormal_close(f.code.into()))
                            .unwrap_or(true);
                        info!(frame = ?frame, abnormal, "WebCast socket closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "WebCast socket error");
                        abnormal = true;
                        break;
                    }
                    None => {
                        warn!("WebCast socket ended without close frame");
                        abnormal = true;
                        break;
                    }
                }
            }
        }

        self.is_connected.store(false, Ordering::SeqCst);
        self.emit(EventKind::ChatDisconnected, json!({})).await;

        if abnormal && self.is_initialized.load(Ordering::SeqCst) {
            self.schedule_reconnect().await;
        }
    }

    async fn handle_frame(&self, text: &str) -> FrameAction {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable WebCast frame");
                return FrameAction::Continue;
            }
        };
        let message_type = frame
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let data = frame.get("data").cloned().unwrap_or(Value::Null);

        // Control action 3 means the host ended the stream
        if message_type == "WebcastControlMessage" {
            let action = data.get("action").and_then(|a| a.as_i64()).unwrap_or(0);
            if action == 3 {
                info!("WebCast stream ended by host");
                return FrameAction::Close { abnormal: false };
            }
            return FrameAction::Continue;
        }

        if let Some((kind, payload)) = map_webcast_message(message_type, &data) {
            self.emit(kind, payload).await;
        } else {
            debug!(message_type, "Ignoring unmapped WebCast message");
        }
        FrameAction::Continue
    }

    pub async fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.retry_attempts.load(Ordering::SeqCst);
        if attempts >= self.config.max_retry_attempts {
            error!(attempts, "WebCast reconnect attempts exhausted");
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
            "Scheduling WebCast reconnect"
        );

        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            client.retry_connect().await;
        });
        let mut timer = match self.reconnect_timer.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    // Boxed so the connect/read-loop/retry cycle has an erased edge and the
    // spawned futures stay provably Send.
    fn retry_connect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.connect().await {
                let attempts = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(attempts, error = %e, "WebCast reconnect failed");
                self.schedule_reconnect().await;
            }
        })
    }

    pub async fn stop(&self) {
        info!("Stopping WebCast client");
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
            platform: PlatformKind::Tiktok,
            kind,
            payload,
        };
        if self.sink.send(event).await.is_err() {
            warn!("Event sink closed, dropping event");
        }
    }
}

fn is_abnormal_close(code: u16) -> bool {
    !matches!(code, 1000 | 1001)
}

/// Room URL for a username. Parsing through `Url` keeps the path intact
/// (a bare host normalizes to `/`) and percent-escapes the query.
fn webcast_url(base: &str, username: &str) -> Result<url::Url> {
    let mut url =
        url::Url::parse(base).map_err(|e| anyhow!("Invalid WebCast URL {}: {}", base, e))?;
    url.query_pairs_mut().append_pair("unique_id", username);
    Ok(url)
}

fn user_fields(data: &Value) -> (Value, Value) {
    let username = data
        .pointer("/user/nickname")
        .or_else(|| data.pointer("/user/uniqueId"))
        .cloned()
        .unwrap_or(Value::Null);
    let user_id = data
        .pointer("/user/userId")
        .cloned()
        .unwrap_or(Value::Null);
    (username, user_id)
}

/// Map a WebCast room message to a raw platform event for the normalizer.
fn map_webcast_message(message_type: &str, data: &Value) -> Option<(EventKind, Value)> {
    let (username, user_id) = user_fields(data);
    let common = data.get("common").cloned().unwrap_or(Value::Null);

    match message_type {
        "WebcastChatMessage" => Some((
            EventKind::ChatMessage,
            json!({
                "username": username,
                "userId": user_id,
                "message": data.get("comment"),
                "common": common,
            }),
        )),
        "WebcastGiftMessage" => Some((
            EventKind::Gift,
            json!({
                "username": username,
                "userId": user_id,
                "id": data.pointer("/common/msgId").or_else(|| data.get("msgId")),
                "giftType": data.pointer("/gift/name"),
                "giftCount": data.get("repeatCount"),
                "diamondCount": data.pointer("/gift/diamondCount"),
                "common": common,
            }),
        )),
        "WebcastSocialMessage" => {
            let display_type = data
                .get("displayType")
                .and_then(|d| d.as_str())
                .unwrap_or_default();
            let kind = if display_type.contains("follow") {
                EventKind::Follow
            } else if display_type.contains("share") {
                EventKind::Share
            } else {
                return None;
            };
            Some((
                kind,
                json!({
                    "username": username,
                    "userId": user_id,
                    "common": common,
                }),
            ))
        }
        "WebcastRoomUserSeqMessage" => Some((
            EventKind::ViewerCount,
            json!({
                "viewerCount": data.get("viewerCount"),
                "common": common,
            }),
        )),
        "WebcastEnvelopeMessage" => Some((
            EventKind::Envelope,
            json!({
                "username": username,
                "userId": user_id,
                "coins": data.pointer("/envelopeInfo/coins"),
                "common": common,
            }),
        )),
        _ => None,
    }
}

/// TikTok driver. Slow-connecting: the orchestrator initializes it in a
/// background task and never blocks startup on it.
pub struct TiktokDriver {
    config: TiktokConfig,
    client: Mutex<Option<Arc<WebcastClient>>>,
}

impl TiktokDriver {
    pub fn new(config: TiktokConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Option<Arc<WebcastClient>> {
        match self.client.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl PlatformDriver for TiktokDriver {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Tiktok
    }

    async fn initialize(&self, sink: EventSink) -> Result<()> {
        if self.config.username.is_none() {
            bail!("TikTok username is not configured");
        }
        let client = WebcastClient::new(self.config.clone(), sink);
        client.initialize().await?;
        let mut slot = match self.client.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(client);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if let Some(client) = self.client() {
            client.stop().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client().map(|c| c.is_connected()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_ws_server<F, Fut>(behavior: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    behavior(ws).await;
                }
            }
        });
        format!("ws://{}", addr)
    }

    fn config(ws_url: String) -> TiktokConfig {
        TiktokConfig {
            enabled: true,
            username: Some("host".to_string()),
            webcast_url: ws_url,
            max_retry_attempts: 3,
        }
    }

    async fn next_of_kind(
        rx: &mut mpsc::Receiver<RawPlatformEvent>,
        kind: EventKind,
    ) -> RawPlatformEvent {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("sink closed");
            if event.kind == kind {
                return event;
            }
        }
    }

    const CHAT_FRAME: &str = r#"{
        "type": "WebcastChatMessage",
        "data": {
            "comment": "hello room",
            "user": {"nickname": "viewer", "userId": "77"},
            "common": {"createTime": 1700000000}
        }
    }"#;

    const GIFT_FRAME: &str = r#"{
        "type": "WebcastGiftMessage",
        "data": {
            "user": {"nickname": "fan", "userId": "88"},
            "repeatCount": 3,
            "gift": {"name": "rose", "diamondCount": 1},
            "common": {"msgId": "g1", "createTime": 1700000000}
        }
    }"#;

    #[tokio::test]
    async fn chat_and_gift_frames_reach_the_sink() {
        let url = local_ws_server(|mut ws| async move {
            ws.send(WsMessage::Text(CHAT_FRAME.into())).await.unwrap();
            ws.send(WsMessage::Text(GIFT_FRAME.into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        })
        .await;

        let driver = TiktokDriver::new(config(url));
        let (tx, mut rx) = mpsc::channel(32);
        driver.initialize(tx).await.unwrap();
        assert!(driver.is_connected());

        next_of_kind(&mut rx, EventKind::ChatConnected).await;
        let chat = next_of_kind(&mut rx, EventKind::ChatMessage).await;
        assert_eq!(chat.payload["username"], "viewer");
        assert_eq!(chat.payload["message"], "hello room");

        let gift = next_of_kind(&mut rx, EventKind::Gift).await;
        assert_eq!(gift.payload["giftType"], "rose");
        assert_eq!(gift.payload["giftCount"], 3);
        assert_eq!(gift.payload["id"], "g1");

        driver.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn host_ending_stream_closes_normally() {
        let url = local_ws_server(|mut ws| async move {
            let control = r#"{"type":"WebcastControlMessage","data":{"action":3}}"#;
            ws.send(WsMessage::Text(control.into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        })
        .await;

        let driver = TiktokDriver::new(config(url));
        let (tx, mut rx) = mpsc::channel(32);
        driver.initialize(tx).await.unwrap();

        next_of_kind(&mut rx, EventKind::ChatDisconnected).await;
        // No abandoned emission: a normal end never schedules reconnects
        assert!(
            timeout(Duration::from_millis(500), async {
                loop {
                    let event = rx.recv().await.expect("sink closed");
                    if event.kind == EventKind::Connection
                        && event.payload["state"] == "abandoned"
                    {
                        return event;
                    }
                }
            })
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn missing_username_fails_initialization() {
        let driver = TiktokDriver::new(TiktokConfig::default());
        let (tx, _rx) = mpsc::channel(4);
        let err = driver.initialize(tx).await.unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[tokio::test]
    async fn exhausted_reconnects_emit_abandoned() {
        let (tx, mut rx) = mpsc::channel(32);
        let client = WebcastClient::new(config("ws://127.0.0.1:1".to_string()), tx);
        client.is_initialized.store(true, Ordering::SeqCst);
        client
            .retry_attempts
            .store(client.config.max_retry_attempts, Ordering::SeqCst);
        client.schedule_reconnect().await;

        let abandoned = next_of_kind(&mut rx, EventKind::Connection).await;
        assert_eq!(abandoned.payload["state"], "abandoned");
        assert!(!client.is_initialized());
    }

    #[test]
    fn webcast_url_keeps_path_and_adds_query() {
        let url = webcast_url(DEFAULT_WEBCAST_URL, "host").unwrap();
        assert_eq!(url.path(), "/webcast/im/ws");
        assert_eq!(url.query(), Some("unique_id=host"));

        // A bare host:port base still produces a valid request path
        let url = webcast_url("ws://127.0.0.1:9000", "host").unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), Some("unique_id=host"));

        assert!(webcast_url("not a url", "host").is_err());
    }

    #[test]
    fn social_messages_split_into_follow_and_share() {
        let follow = json!({
            "displayType": "pm_main_follow_message_viewer",
            "user": {"nickname": "f", "userId": "1"},
        });
        let (kind, payload) = map_webcast_message("WebcastSocialMessage", &follow).unwrap();
        assert_eq!(kind, EventKind::Follow);
        assert_eq!(payload["username"], "f");

        let share = json!({
            "displayType": "pm_mt_guidance_share",
            "user": {"nickname": "s", "userId": "2"},
        });
        let (kind, _) = map_webcast_message("WebcastSocialMessage", &share).unwrap();
        assert_eq!(kind, EventKind::Share);

        assert!(map_webcast_message("WebcastUnknown", &json!({})).is_none());
    }

    #[test]
    fn viewer_count_and_envelope_map() {
        let seq = json!({"viewerCount": 1234});
        let (kind, payload) = map_webcast_message("WebcastRoomUserSeqMessage", &seq).unwrap();
        assert_eq!(kind, EventKind::ViewerCount);
        assert_eq!(payload["viewerCount"], 1234);

        let envelope = json!({
            "user": {"nickname": "e", "userId": "3"},
            "envelopeInfo": {"coins": 500},
        });
        let (kind, payload) = map_webcast_message("WebcastEnvelopeMessage", &envelope).unwrap();
        assert_eq!(kind, EventKind::Envelope);
        assert_eq!(payload["coins"], 500);
    }
}
