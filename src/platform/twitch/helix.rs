use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ErrorCategory, ErrorCode, PolychatError, PolychatResult};

pub const DEFAULT_HELIX_URL: &str = "https://api.twitch.tv/helix";

/// Minimal Helix REST client: streams, users, channels, and EventSub
/// subscription management. The base URL is injectable for tests.
pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    access_token: Arc<RwLock<String>>,
}

impl HelixClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        access_token: Arc<RwLock<String>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            client_id: client_id.into(),
            access_token,
        }
    }

    /// Swap in a freshly refreshed access token
    pub async fn set_access_token(&self, token: String) {
        *self.access_token.write().await = token;
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> PolychatResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.access_token.read().await.clone();
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Client-Id", &self.client_id)
            .query(query);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            PolychatError::new(ErrorCode::ApiRequestFailed)
                .message(format!("Helix request failed: {}", e))
                .context(format!("{} {}", method, path))
                .category(ErrorCategory::Network)
                .build()
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if status.as_u16() == 401 {
            warn!(path, "Helix returned 401");
            return Err(PolychatError::new(ErrorCode::ApiAuthenticationFailed)
                .message(format!("Helix 401 Unauthorized: {}", api_message(&parsed)))
                .context(path.to_string())
                .category(ErrorCategory::Authentication)
                .build());
        }
        if status.as_u16() == 429 {
            return Err(PolychatError::new(ErrorCode::ApiRateLimited)
                .message(format!("Helix rate limited: {}", api_message(&parsed)))
                .context(path.to_string())
                .category(ErrorCategory::RateLimit)
                .build());
        }
        if !status.is_success() {
            return Err(PolychatError::new(ErrorCode::ApiRequestFailed)
                .message(format!(
                    "Helix request failed (HTTP {}): {}",
                    status,
                    api_message(&parsed)
                ))
                .context(path.to_string())
                .category(ErrorCategory::ServiceUnavailable)
                .build());
        }
        debug!(path, status = status.as_u16(), "Helix request ok");
        Ok(parsed)
    }

    /// `GET /streams?user_id=…` — empty `data` means offline
    pub async fn get_streams(&self, user_id: &str) -> PolychatResult<Value> {
        self.request(reqwest::Method::GET, "/streams", &[("user_id", user_id)], None)
            .await
    }

    /// `GET /users` — without a login, resolves the token's own user
    pub async fn get_users(&self, login: Option<&str>) -> PolychatResult<Value> {
        let query: Vec<(&str, &str)> = match login {
            Some(login) => vec![("login", login)],
            None => vec![],
        };
        self.request(reqwest::Method::GET, "/users", &query, None)
            .await
    }

    pub async fn get_channels(&self, broadcaster_id: &str) -> PolychatResult<Value> {
        self.request(
            reqwest::Method::GET,
            "/channels",
            &[("broadcaster_id", broadcaster_id)],
            None,
        )
        .await
    }

    pub async fn create_eventsub_subscription(&self, body: &Value) -> PolychatResult<Value> {
        self.request(
            reqwest::Method::POST,
            "/eventsub/subscriptions",
            &[],
            Some(body),
        )
        .await
    }

    pub async fn list_eventsub_subscriptions(&self) -> PolychatResult<Value> {
        self.request(reqwest::Method::GET, "/eventsub/subscriptions", &[], None)
            .await
    }

    pub async fn delete_eventsub_subscription(&self, id: &str) -> PolychatResult<()> {
        self.request(
            reqwest::Method::DELETE,
            "/eventsub/subscriptions",
            &[("id", id)],
            None,
        )
        .await
        .map(|_| ())
    }
}

fn api_message(body: &Value) -> String {
    body.get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("no detail")
        .to_string()
}
