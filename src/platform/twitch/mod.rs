pub mod eventsub;
pub mod helix;
pub mod subscriptions;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth::error_handler::analyze_refresh_failure;
use crate::auth::refresh::{with_auth_retry, RefreshRequest, TokenRefresher};
use crate::auth::store::{TokenRecord, TokenStore};
use crate::auth::AuthStateMachine;
use crate::error::{ErrorCategory, ErrorCode, PolychatError, PolychatResult};
use crate::events::schema::EventKind;
use crate::platform::{EventSink, PlatformDriver, PlatformKind, RawPlatformEvent};

use eventsub::{EventSubClient, EventSubConfig};
use helix::HelixClient;
use subscriptions::SubscriptionManager;

#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Channel to join; when None, the token owner's own channel
    pub channel_login: Option<String>,
    pub helix_url: String,
    pub eventsub_url: String,
    pub token_url: String,
    pub max_retry_attempts: u32,
}

impl TwitchConfig {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            channel_login: None,
            helix_url: helix::DEFAULT_HELIX_URL.to_string(),
            eventsub_url: eventsub::DEFAULT_EVENTSUB_URL.to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            max_retry_attempts: 5,
        }
    }
}

/// Twitch chat connection: Helix for identity and stream state, EventSub
/// over WebSocket for the event feed, with the single-forced-refresh 401
/// policy wired through the auth state machine.
pub struct TwitchDriver {
    config: TwitchConfig,
    helix: Arc<HelixClient>,
    auth: Arc<AuthStateMachine>,
    refresher: Arc<TokenRefresher>,
    store: Arc<TokenStore>,
    access_token: Arc<RwLock<String>>,
    client: Mutex<Option<Arc<EventSubClient>>>,
}

impl TwitchDriver {
    pub fn new(config: TwitchConfig, store: Arc<TokenStore>) -> Self {
        let access_token = Arc::new(RwLock::new(String::new()));
        let helix = Arc::new(HelixClient::new(
            config.helix_url.clone(),
            config.client_id.clone(),
            Arc::clone(&access_token),
        ));
        let refresher = Arc::new(TokenRefresher::new(config.token_url.clone()));
        Self {
            config,
            helix,
            auth: Arc::new(AuthStateMachine::new()),
            refresher,
            store,
            access_token,
            client: Mutex::new(None),
        }
    }

    pub fn auth(&self) -> Arc<AuthStateMachine> {
        Arc::clone(&self.auth)
    }

    async fn load_tokens(&self) -> PolychatResult<TokenRecord> {
        let record = self
            .store
            .get(PlatformKind::Twitch)
            .map_err(|e| {
                PolychatError::new(ErrorCode::AuthStateError)
                    .message(format!("Token store unavailable: {}", e))
                    .category(ErrorCategory::Configuration)
                    .build()
            })?
            .ok_or_else(|| {
                PolychatError::new(ErrorCode::AuthTokenInvalid)
                    .message("No stored Twitch credentials; authorization required")
                    .category(ErrorCategory::Authentication)
                    .build()
            })?;
        *self.access_token.write().await = record.access_token.clone();
        Ok(record)
    }

    /// Force one token refresh through the state machine. Concurrent
    /// callers that lose the race wait for the winner's outcome instead.
    async fn force_refresh(&self) -> PolychatResult<()> {
        if !self.auth.start_refresh() {
            return self.auth.execute_when_ready(|| async { Ok(()) }).await;
        }

        let result = self.run_refresh().await;
        self.auth.finish_refresh(result.is_ok());
        result
    }

    async fn run_refresh(&self) -> PolychatResult<()> {
        let record = self.load_tokens().await?;
        let refresh_token = record.refresh_token.ok_or_else(|| {
            PolychatError::new(ErrorCode::AuthRefreshFailed)
                .message("No refresh token on record")
                .category(ErrorCategory::Authentication)
                .build()
        })?;

        let request = RefreshRequest {
            refresh_token,
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        };
        match self.refresher.refresh(&request).await {
            Ok(tokens) => {
                let record = TokenRecord::new(
                    tokens.access_token.clone(),
                    Some(tokens.refresh_token),
                )
                .with_expires_in(tokens.expires_in as i64);
                self.store
                    .store(PlatformKind::Twitch, record)
                    .map_err(|e| {
                        PolychatError::new(ErrorCode::AuthRefreshFailed)
                            .message(format!("Could not persist refreshed tokens: {}", e))
                            .category(ErrorCategory::Internal)
                            .build()
                    })?;
                self.helix.set_access_token(tokens.access_token).await;
                Ok(())
            }
            Err(failure) => {
                let analysis = analyze_refresh_failure(&failure);
                warn!(kind = ?analysis.kind, "Twitch token refresh failed");
                Err(PolychatError::new(ErrorCode::AuthRefreshFailed)
                    .message(failure.message)
                    .context(format!("{:?}", analysis.kind))
                    .category(ErrorCategory::Authentication)
                    .build())
            }
        }
    }

    /// Resolve the authorized user and the broadcaster to join.
    async fn resolve_identities(&self) -> PolychatResult<(String, String)> {
        let own = with_auth_retry(
            || self.helix.get_users(None),
            || self.force_refresh(),
        )
        .await?;
        let user_id = own
            .pointer("/data/0/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PolychatError::new(ErrorCode::ApiRequestFailed)
                    .message("Could not resolve token owner")
                    .category(ErrorCategory::Authentication)
                    .build()
            })?
            .to_string();

        let broadcaster_id = match &self.config.channel_login {
            Some(login) => {
                let response = with_auth_retry(
                    || self.helix.get_users(Some(login)),
                    || self.force_refresh(),
                )
                .await?;
                response
                    .pointer("/data/0/id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        PolychatError::new(ErrorCode::ApiRequestFailed)
                            .message(format!("Unknown channel: {}", login))
                            .category(ErrorCategory::Configuration)
                            .build()
                    })?
                    .to_string()
            }
            None => user_id.clone(),
        };
        Ok((broadcaster_id, user_id))
    }

    /// Surface provider throttling to the pipeline before the error
    /// propagates.
    async fn note_throttling(&self, sink: &EventSink, error: &PolychatError) {
        if error.code != ErrorCode::ApiRateLimited {
            return;
        }
        let _ = sink
            .send(RawPlatformEvent {
                platform: PlatformKind::Twitch,
                kind: EventKind::RateLimitHit,
                payload: json!({ "message": error.message.clone() }),
            })
            .await;
    }

    /// Check live state and emit `platform:stream-status`.
    async fn detect_stream(&self, broadcaster_id: &str, sink: &EventSink) -> PolychatResult<bool> {
        let response = with_auth_retry(
            || self.helix.get_streams(broadcaster_id),
            || self.force_refresh(),
        )
        .await?;
        let streams = response
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default();
        let is_live = !streams.is_empty();
        let title = streams
            .first()
            .and_then(|s| s.get("title"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let _ = sink
            .send(RawPlatformEvent {
                platform: PlatformKind::Twitch,
                kind: EventKind::StreamStatus,
                payload: json!({ "isLive": is_live, "title": title }),
            })
            .await;
        Ok(is_live)
    }
}

#[async_trait]
impl PlatformDriver for TwitchDriver {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Twitch
    }

    async fn initialize(&self, sink: EventSink) -> Result<()> {
        self.load_tokens().await.map_err(|e| anyhow!("{}", e))?;
        let (broadcaster_id, user_id) = match self.resolve_identities().await {
            Ok(ids) => ids,
            Err(e) => {
                self.note_throttling(&sink, &e).await;
                return Err(anyhow!("{}", e));
            }
        };
        info!(broadcaster_id = %broadcaster_id, "Twitch identities resolved");

        if let Err(e) = self.detect_stream(&broadcaster_id, &sink).await {
            self.note_throttling(&sink, &e).await;
            return Err(anyhow!("{}", e));
        }

        let subs = Arc::new(SubscriptionManager::new(Arc::clone(&self.helix)));
        let mut config = EventSubConfig::new(&broadcaster_id, &user_id);
        config.ws_url = self.config.eventsub_url.clone();
        config.max_retry_attempts = self.config.max_retry_attempts;

        let client = EventSubClient::new(config, subs, Arc::clone(&self.auth), sink);
        client.initialize().await?;
        match self.client.lock() {
            Ok(mut slot) => *slot = Some(client),
            Err(poisoned) => *poisoned.into_inner() = Some(client),
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let client = match self.client.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(client) = client {
            client.stop().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.client.lock() {
            Ok(slot) => slot.as_ref().map(|c| c.is_connected()).unwrap_or(false),
            Err(_) => false,
        }
    }
}
