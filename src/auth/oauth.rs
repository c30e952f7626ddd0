use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::store::{TokenRecord, TokenStore};
use crate::platform::PlatformKind;

/// How long to wait for the user to complete the flow in the browser
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// How many consecutive ports to probe before giving up
const PORT_PROBE_RANGE: u16 = 10;

/// Scopes every chat connection needs; used when the configuration does not
/// override the scope set
pub const REQUIRED_SCOPES: &[&str] = &[
    "user:read:chat",
    "chat:edit",
    "channel:read:subscriptions",
    "bits:read",
    "channel:read:redemptions",
    "moderator:read:followers",
];

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Provider authorization endpoint
    pub auth_url: String,
    /// Provider token endpoint
    pub token_url: String,
    pub scopes: Vec<String>,
    /// First loopback port to try for the callback server
    pub callback_port: u16,
    /// When false (tests, headless hosts) the authorize URL is only logged
    pub open_browser: bool,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: String,
    outcome: mpsc::Sender<Result<String, String>>,
}

/// Authorization-code flow against a loopback HTTPS callback server.
///
/// The self-signed certificate is generated once and cached for the
/// lifetime of the handler, so repeated flows reuse it.
pub struct OAuthHandler {
    config: OAuthConfig,
    http: reqwest::Client,
    store: Arc<TokenStore>,
    cert_cache: Mutex<Option<(String, String)>>,
}

/// An in-progress flow: the callback server is listening and the browser
/// has been pointed at the provider.
pub struct OAuthFlow<'a> {
    handler: &'a OAuthHandler,
    platform: PlatformKind,
    pub authorize_url: String,
    pub port: u16,
    server_handle: Handle,
    outcome_rx: mpsc::Receiver<Result<String, String>>,
}

impl OAuthHandler {
    pub fn new(config: OAuthConfig, store: Arc<TokenStore>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            store,
            cert_cache: Mutex::new(None),
        }
    }

    /// Probe for a free loopback port starting at the configured default.
    fn find_port(&self) -> Result<u16> {
        for offset in 0..PORT_PROBE_RANGE {
            let port = self.config.callback_port + offset;
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(listener) => {
                    drop(listener);
                    if offset > 0 {
                        debug!(port, "Default callback port busy, using fallback");
                    }
                    return Ok(port);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e).context("probing callback port"),
            }
        }
        Err(anyhow!(
            "No free callback port in {}..{}",
            self.config.callback_port,
            self.config.callback_port + PORT_PROBE_RANGE
        ))
    }

    /// Self-signed cert for localhost, generated once per handler.
    fn certificate(&self) -> Result<(String, String)> {
        let mut cache = match self.cert_cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pems) = cache.as_ref() {
            return Ok(pems.clone());
        }
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .context("generating self-signed certificate")?;
        let pems = (
            certified.cert.pem(),
            certified.signing_key.serialize_pem(),
        );
        *cache = Some(pems.clone());
        debug!("Generated self-signed certificate for loopback callback");
        Ok(pems)
    }

    /// Start the callback server and point the user's browser at the
    /// provider. Errors here happen before the server is serving, so they
    /// are real errors rather than a null result.
    pub async fn begin(&self, platform: PlatformKind) -> Result<OAuthFlow<'_>> {
        let port = self.find_port()?;
        let (cert_pem, key_pem) = self.certificate()?;
        let tls = RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
            .await
            .context("building TLS config")?;

        let state_token = Uuid::new_v4().to_string();
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let callback_state = CallbackState {
            expected_state: state_token.clone(),
            outcome: outcome_tx,
        };
        let router = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(callback_state);

        let server_handle = Handle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let serve_handle = server_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(addr, tls)
                .handle(serve_handle)
                .serve(router.into_make_service())
                .await
            {
                error!(error = %e, "Callback server stopped unexpectedly");
            }
        });
        info!(port, platform = %platform, "OAuth callback server listening");

        let redirect_uri = format!("https://localhost:{}/callback", port);
        let scope = if self.config.scopes.is_empty() {
            REQUIRED_SCOPES.join(" ")
        } else {
            self.config.scopes.join(" ")
        };
        let mut authorize_url = Url::parse(&self.config.auth_url)?;
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", &state_token);
        let authorize_url = authorize_url.to_string();

        if self.config.open_browser {
            if let Err(e) = open::that(&authorize_url) {
                warn!(error = %e, "Could not open browser; authorize manually");
            }
        } else {
            info!(url = %authorize_url, "Browser disabled; authorize manually");
        }

        Ok(OAuthFlow {
            handler: self,
            platform,
            authorize_url,
            port,
            server_handle,
            outcome_rx,
        })
    }

    /// Convenience wrapper: begin and wait for completion.
    pub async fn authorize(&self, platform: PlatformKind) -> Result<Option<TokenRecord>> {
        let flow = self.begin(platform).await?;
        flow.finish().await
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenRecord> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ];
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .context("token exchange request")?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.context("token exchange body")?;
        if !status.is_success() {
            return Err(anyhow!(
                "token exchange failed (HTTP {}): {}",
                status,
                body.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
            ));
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("token response missing access_token"))?
            .to_string();
        let refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let mut record = TokenRecord::new(access_token, refresh_token);
        if let Some(expires_in) = body.get("expires_in").and_then(|v| v.as_i64()) {
            record = record.with_expires_in(expires_in);
        }
        if let Some(scope) = body.get("scope").and_then(|v| v.as_array()) {
            record.scope = scope
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect();
        }
        Ok(record)
    }
}

impl OAuthFlow<'_> {
    /// Wait for the callback, exchange the code, persist the tokens, and
    /// shut the server down. Failures after this point resolve to
    /// `Ok(None)` so callers can fall back to re-authorization prompts.
    pub async fn finish(mut self) -> Result<Option<TokenRecord>> {
        let outcome = tokio::time::timeout(CALLBACK_TIMEOUT, self.outcome_rx.recv()).await;
        // The server has done its job whatever the outcome; close it once
        self.server_handle.shutdown();

        let code = match outcome {
            Ok(Some(Ok(code))) => code,
            Ok(Some(Err(provider_error))) => {
                warn!(platform = %self.platform, error = %provider_error, "Authorization rejected");
                return Ok(None);
            }
            Ok(None) => {
                warn!(platform = %self.platform, "Callback channel closed without a result");
                return Ok(None);
            }
            Err(_) => {
                warn!(platform = %self.platform, "Timed out waiting for authorization callback");
                return Ok(None);
            }
        };

        let redirect_uri = format!("https://localhost:{}/callback", self.port);
        match self.handler.exchange_code(&code, &redirect_uri).await {
            Ok(record) => {
                let report = self.handler.store.store(self.platform, record.clone())?;
                if report.degraded {
                    warn!(platform = %self.platform, "Authorized without refresh token");
                }
                info!(platform = %self.platform, "Authorization complete, tokens stored");
                Ok(Some(record))
            }
            Err(e) => {
                error!(platform = %self.platform, error = %e, "Code exchange failed");
                Ok(None)
            }
        }
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<String> {
    if let Some(provider_error) = params.get("error") {
        let _ = state.outcome.send(Err(provider_error.clone())).await;
        return Html(error_page("Authorization Failed", provider_error));
    }
    match params.get("code") {
        Some(code) if params.get("state") == Some(&state.expected_state) => {
            let _ = state.outcome.send(Ok(code.clone())).await;
            Html(success_page())
        }
        Some(_) => {
            let _ = state
                .outcome
                .send(Err("state mismatch".to_string()))
                .await;
            Html(error_page("Invalid Callback", "State parameter mismatch"))
        }
        None => {
            let _ = state
                .outcome
                .send(Err("Invalid Callback".to_string()))
                .await;
            Html(error_page("Invalid Callback", "Missing authorization code"))
        }
    }
}

fn success_page() -> String {
    "<html><body><h1>Authorization Complete</h1>\
     <p>You can close this window and return to the application.</p>\
     </body></html>"
        .to_string()
}

fn error_page(title: &str, detail: &str) -> String {
    format!(
        "<html><body><h1>{}</h1><p>{}</p></body></html>",
        title, detail
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(callback_port: u16, token_url: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            auth_url: "https://id.example.com/oauth2/authorize".to_string(),
            token_url: token_url.to_string(),
            scopes: vec!["chat:read".to_string(), "chat:edit".to_string()],
            callback_port,
            open_browser: false,
        }
    }

    fn handler(port: u16, token_url: &str) -> (OAuthHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
        (OAuthHandler::new(config(port, token_url), store), dir)
    }

    #[tokio::test]
    async fn busy_port_falls_through_to_next() {
        let (h, _dir) = handler(39180, "https://unused.example.com");
        // Occupy the default port so the probe has to move on
        let _blocker = TcpListener::bind(("127.0.0.1", 39180)).unwrap();
        let port = h.find_port().unwrap();
        assert_eq!(port, 39181);
    }

    #[tokio::test]
    async fn certificate_is_cached_across_calls() {
        let (h, _dir) = handler(39190, "https://unused.example.com");
        let first = h.certificate().unwrap();
        let second = h.certificate().unwrap();
        assert_eq!(first.0, second.0);
        assert!(first.0.contains("BEGIN CERTIFICATE"));
        assert!(first.1.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn authorize_url_carries_expected_parameters() {
        let (h, _dir) = handler(39200, "https://unused.example.com");
        let flow = h.begin(PlatformKind::Twitch).await.unwrap();

        let url = Url::parse(&flow.authorize_url).unwrap();
        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(params.get("client_id").map(String::as_str), Some("cid"));
        assert_eq!(
            params.get("redirect_uri").map(String::as_str),
            Some(format!("https://localhost:{}/callback", flow.port).as_str())
        );
        assert_eq!(params.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(
            params.get("scope").map(String::as_str),
            Some("chat:read chat:edit")
        );
        assert!(params.contains_key("state"));
        flow.server_handle.shutdown();
    }

    #[tokio::test]
    async fn empty_scope_config_falls_back_to_the_required_set() {
        let mut cfg = config(39240, "https://unused.example.com");
        cfg.scopes = Vec::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
        let h = OAuthHandler::new(cfg, store);

        let flow = h.begin(PlatformKind::Twitch).await.unwrap();
        let url = Url::parse(&flow.authorize_url).unwrap();
        let scope = url
            .query_pairs()
            .find(|(k, _)| k == "scope")
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_eq!(scope, REQUIRED_SCOPES.join(" "));
        for required in REQUIRED_SCOPES {
            assert!(scope.split(' ').any(|s| s == *required), "{}", required);
        }
        flow.server_handle.shutdown();
    }

    #[tokio::test]
    async fn full_flow_exchanges_code_and_persists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "the-code".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"access_token":"at","refresh_token":"rt","expires_in":3600,"scope":["chat:read"]}"#,
            )
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TokenStore::new(dir.path().join("tokens.json")));
        let h = OAuthHandler::new(
            config(39210, &format!("{}/oauth2/token", server.url())),
            Arc::clone(&store),
        );

        let flow = h.begin(PlatformKind::Twitch).await.unwrap();
        let state = Url::parse(&flow.authorize_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.to_string())
            .unwrap();
        let port = flow.port;

        // Simulate the provider redirecting the browser to the callback
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let callback = tokio::spawn(async move {
            // Give the flow a moment to start waiting
            tokio::time::sleep(Duration::from_millis(100)).await;
            client
                .get(format!(
                    "https://localhost:{}/callback?code=the-code&state={}",
                    port, state
                ))
                .send()
                .await
        });

        let record = flow.finish().await.unwrap().expect("tokens");
        assert_eq!(record.access_token, "at");
        assert_eq!(record.refresh_token.as_deref(), Some("rt"));

        let persisted = store.get(PlatformKind::Twitch).unwrap().unwrap();
        assert_eq!(persisted.access_token, "at");

        let response = callback.await.unwrap().unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn provider_error_resolves_to_none() {
        let (h, _dir) = handler(39220, "https://unused.example.com");
        let flow = h.begin(PlatformKind::Twitch).await.unwrap();
        let port = flow.port;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = client
                .get(format!(
                    "https://localhost:{}/callback?error=access_denied",
                    port
                ))
                .send()
                .await;
        });

        let result = flow.finish().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_code_is_an_invalid_callback() {
        let (h, _dir) = handler(39230, "https://unused.example.com");
        let flow = h.begin(PlatformKind::Twitch).await.unwrap();
        let port = flow.port;

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let body = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client
                .get(format!("https://localhost:{}/callback", port))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });

        assert!(flow.finish().await.unwrap().is_none());
        assert!(body.await.unwrap().contains("Invalid Callback"));
    }
}
