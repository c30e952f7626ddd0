pub mod innertube;
pub mod registry;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::events::schema::EventKind;
use crate::platform::youtube::innertube::{
    extract_between, InnerTubeClient, InnerTubeConnection, DEFAULT_INNERTUBE_URL,
};
use crate::platform::youtube::registry::{ConnectionRegistry, ConnectionState, LiveChatConnection};
use crate::platform::{EventSink, PlatformDriver, PlatformKind, RawPlatformEvent};

pub const DEFAULT_DATA_API_URL: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeConfig {
    pub enabled: bool,
    /// Data API key; enables API-based live stream detection
    pub api_key: Option<String>,
    /// Fall back to scraping the channel's /live page for the video id
    pub enable_scraping: bool,
    pub channel_id: Option<String>,
    pub innertube_url: String,
    pub data_api_url: String,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            enable_scraping: true,
            channel_id: None,
            innertube_url: DEFAULT_INNERTUBE_URL.to_string(),
            data_api_url: DEFAULT_DATA_API_URL.to_string(),
        }
    }
}

/// YouTube driver: detects the channel's live stream, then runs one
/// registry-tracked InnerTube polling connection against its live chat.
pub struct YoutubeDriver {
    config: YoutubeConfig,
    client: Arc<InnerTubeClient>,
    registry: Arc<ConnectionRegistry>,
    http: reqwest::Client,
}

impl YoutubeDriver {
    pub fn new(config: YoutubeConfig) -> Self {
        let client = Arc::new(InnerTubeClient::new(config.innertube_url.clone()));
        let registry = Arc::new(ConnectionRegistry::new(
            config.api_key.is_some(),
            config.enable_scraping,
        ));
        Self {
            config,
            client,
            registry,
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Find the channel's current live video id, preferring the Data API
    /// when a key is configured and falling back to scraping the /live page.
    pub async fn detect_live_video_id(&self) -> Result<Option<String>> {
        let channel_id = match &self.config.channel_id {
            Some(id) => id.clone(),
            None => bail!("YouTube channel id is not configured"),
        };

        if self.registry.is_api_enabled() {
            if let Some(api_key) = &self.config.api_key {
                return self.detect_via_api(&channel_id, api_key).await;
            }
        }
        if self.registry.is_scraping_enabled() {
            return self.detect_via_scraping(&channel_id).await;
        }
        bail!("YouTube stream detection is not configured (no API key, scraping disabled)")
    }

    async fn detect_via_api(&self, channel_id: &str, api_key: &str) -> Result<Option<String>> {
        let url = format!("{}/search", self.config.data_api_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("part", "snippet"),
                ("channelId", channel_id),
                ("eventType", "live"),
                ("type", "video"),
                ("key", api_key),
            ])
            .send()
            .await
            .context("live search request failed")?;
        if !response.status().is_success() {
            bail!("live search returned HTTP {}", response.status());
        }
        let body: serde_json::Value = response.json().await.context("live search bad JSON")?;
        Ok(body
            .pointer("/items/0/id/videoId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn detect_via_scraping(&self, channel_id: &str) -> Result<Option<String>> {
        let url = format!("{}/channel/{}/live", self.config.innertube_url, channel_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("channel live page request failed")?;
        if !response.status().is_success() {
            bail!("channel live page returned HTTP {}", response.status());
        }
        let html = response.text().await.context("channel live page read failed")?;
        // An offline channel page has no live chat continuation
        if !html.contains("\"isLive\":true") && !html.contains("liveStreamability") {
            return Ok(None);
        }
        Ok(extract_between(&html, "\"videoId\":\"", "\""))
    }

    async fn connect_live_chat(&self, video_id: &str, sink: EventSink) -> Result<()> {
        let client = self.client.clone();
        let registry = self.registry.clone();
        let ready_sink = sink.clone();
        let ready_video = video_id.to_string();

        let factory = move |id: String| -> BoxFuture<'static, Result<Arc<dyn LiveChatConnection>>> {
            let client = client.clone();
            let registry = registry.clone();
            let sink = ready_sink.clone();
            let ready_video = ready_video.clone();
            Box::pin(async move {
                let context = client.fetch_live_chat_context(&id).await?;
                let connection =
                    Arc::new(InnerTubeConnection::new(client, id.clone(), sink.clone()));
                connection.start(context, move || {
                    registry.set_connection_ready(&ready_video);
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let _ = sink
                            .send(RawPlatformEvent {
                                platform: PlatformKind::Youtube,
                                kind: EventKind::ChatConnected,
                                payload: json!({ "videoId": ready_video }),
                            })
                            .await;
                    });
                });
                Ok(connection as Arc<dyn LiveChatConnection>)
            })
        };

        if !self.registry.connect(video_id, &factory).await {
            let detail = self
                .registry
                .snapshot(video_id)
                .and_then(|s| s.metadata.error)
                .unwrap_or_else(|| "connection already exists".to_string());
            bail!("YouTube live chat connection failed: {}", detail);
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformDriver for YoutubeDriver {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Youtube
    }

    async fn initialize(&self, sink: EventSink) -> Result<()> {
        let video_id = match self.detect_live_video_id().await? {
            Some(id) => id,
            None => {
                info!("No live stream on the configured YouTube channel");
                let _ = sink
                    .send(RawPlatformEvent {
                        platform: PlatformKind::Youtube,
                        kind: EventKind::StreamStatus,
                        payload: json!({ "isLive": false }),
                    })
                    .await;
                return Ok(());
            }
        };

        info!(video_id = %video_id, "YouTube live stream detected");
        let _ = sink
            .send(RawPlatformEvent {
                platform: PlatformKind::Youtube,
                kind: EventKind::StreamDetected,
                payload: json!({ "videoId": video_id }),
            })
            .await;
        let _ = sink
            .send(RawPlatformEvent {
                platform: PlatformKind::Youtube,
                kind: EventKind::StreamStatus,
                payload: json!({ "isLive": true, "videoId": video_id }),
            })
            .await;

        self.connect_live_chat(&video_id, sink).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.registry.cleanup_all_connections().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.registry.get_active_video_ids().iter().any(|id| {
            self.registry
                .snapshot(id)
                .map(|s| {
                    matches!(
                        s.state,
                        ConnectionState::Connected | ConnectionState::Ready
                    )
                })
                .unwrap_or(false)
        })
    }
}
