use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::{PolychatError, PolychatResult};

/// Refresh no later than this long before expiry
const MIN_REFRESH_LEAD: Duration = Duration::minutes(5);

/// Fraction of the remaining lifetime reserved as refresh lead time
const LEAD_FRACTION: f64 = 0.10;

/// Credentials needed to exchange a refresh token
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

/// A successful token exchange
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

/// A failed exchange, with everything the auth error handler needs to
/// decide terminal-vs-recoverable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// OAuth `error` field from the provider response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transport-level error code (e.g. "ECONNREFUSED")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Retry-After header in seconds, when the provider sent one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl std::fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "refresh failed (HTTP {}): {}", status, self.message),
            None => write!(f, "refresh failed: {}", self.message),
        }
    }
}

/// Exchanges refresh tokens at a provider token endpoint
pub struct TokenRefresher {
    http: reqwest::Client,
    token_url: String,
}

impl TokenRefresher {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
        }
    }

    /// POST the refresh grant. Success requires a 2xx response carrying both
    /// tokens and a numeric `expires_in`.
    pub async fn refresh(&self, request: &RefreshRequest) -> Result<RefreshedTokens, RefreshFailure> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", request.refresh_token.as_str()),
            ("client_id", request.client_id.as_str()),
            ("client_secret", request.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshFailure {
                message: e.to_string(),
                status: None,
                error: None,
                code: transport_code(&e),
                retry_after: None,
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let parsed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
            let error = parsed
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string);
            let message = parsed
                .get("message")
                .or_else(|| parsed.get("error_description"))
                .and_then(|m| m.as_str())
                .unwrap_or(&body)
                .to_string();
            warn!(status = status.as_u16(), error = ?error, "Token refresh rejected");
            return Err(RefreshFailure {
                message,
                status: Some(status.as_u16()),
                error,
                code: None,
                retry_after,
            });
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| RefreshFailure {
                message: format!("invalid token response: {}", e),
                status: Some(status.as_u16()),
                error: None,
                code: None,
                retry_after: None,
            })?;

        // A response missing either token or a numeric expiry is unusable
        let complete = parsed.get("access_token").and_then(|v| v.as_str()).is_some()
            && parsed.get("refresh_token").and_then(|v| v.as_str()).is_some()
            && parsed.get("expires_in").and_then(|v| v.as_u64()).is_some();
        if !complete {
            return Err(RefreshFailure {
                message: "token response missing access_token, refresh_token or expires_in"
                    .to_string(),
                status: Some(status.as_u16()),
                error: None,
                code: None,
                retry_after: None,
            });
        }

        let tokens: RefreshedTokens =
            serde_json::from_value(parsed).map_err(|e| RefreshFailure {
                message: format!("invalid token response: {}", e),
                status: Some(status.as_u16()),
                error: None,
                code: None,
                retry_after: None,
            })?;
        info!(expires_in = tokens.expires_in, "Token refresh succeeded");
        Ok(tokens)
    }
}

fn transport_code(e: &reqwest::Error) -> Option<String> {
    if e.is_timeout() {
        Some("ETIMEDOUT".to_string())
    } else if e.is_connect() {
        Some("ECONNREFUSED".to_string())
    } else {
        None
    }
}

/// When (and whether) a proactive refresh can be scheduled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshScheduling {
    pub can_schedule: bool,
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Refresh at `expires_at` minus the larger of five minutes or 10% of the
/// remaining lifetime; instants already past schedule immediately.
pub fn calculate_refresh_scheduling(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RefreshScheduling {
    let expires_at = match expires_at {
        Some(e) => e,
        None => {
            return RefreshScheduling {
                can_schedule: false,
                delay_ms: 0,
                reason: Some("token has no known expiry".to_string()),
            };
        }
    };

    let lifetime = expires_at - now;
    let fraction_ms = (lifetime.num_milliseconds() as f64 * LEAD_FRACTION) as i64;
    let lead = MIN_REFRESH_LEAD.max(Duration::milliseconds(fraction_ms));
    let refresh_at = expires_at - lead;
    let delay_ms = (refresh_at - now).num_milliseconds().max(0) as u64;

    debug!(delay_ms, "Refresh scheduling calculated");
    RefreshScheduling {
        can_schedule: true,
        delay_ms,
        reason: None,
    }
}

/// Run an API call with the standard 401 policy: on an authentication
/// failure, force one token refresh and retry exactly once.
pub async fn with_auth_retry<T, F, Fut, R, RFut>(
    operation: F,
    force_refresh: R,
) -> PolychatResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = PolychatResult<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = PolychatResult<()>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(e) if is_auth_failure(&e) => {
            warn!(error = %e, "Request unauthorized, refreshing token and retrying once");
            force_refresh().await?;
            operation().await
        }
        Err(e) => Err(e),
    }
}

fn is_auth_failure(e: &PolychatError) -> bool {
    use crate::error::ErrorCode;
    matches!(
        e.code,
        ErrorCode::ApiAuthenticationFailed | ErrorCode::AuthTokenExpired | ErrorCode::AuthTokenInvalid
    ) || e.message.contains("401")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ErrorCode};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn request() -> RefreshRequest {
        RefreshRequest {
            refresh_token: "rt".to_string(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_refresh_parses_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth2/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "rt".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "cid".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"access_token":"new-at","refresh_token":"new-rt","expires_in":14400}"#,
            )
            .create_async()
            .await;

        let refresher = TokenRefresher::new(format!("{}/oauth2/token", server.url()));
        let tokens = refresher.refresh(&request()).await.unwrap();
        assert_eq!(tokens.access_token, "new-at");
        assert_eq!(tokens.refresh_token, "new-rt");
        assert_eq!(tokens.expires_in, 14400);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn incomplete_response_is_a_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"only-this"}"#)
            .create_async()
            .await;

        let refresher = TokenRefresher::new(format!("{}/oauth2/token", server.url()));
        let failure = refresher.refresh(&request()).await.unwrap_err();
        assert!(failure.message.contains("missing"));
    }

    #[tokio::test]
    async fn provider_rejection_carries_status_and_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","message":"Invalid refresh token"}"#)
            .create_async()
            .await;

        let refresher = TokenRefresher::new(format!("{}/oauth2/token", server.url()));
        let failure = refresher.refresh(&request()).await.unwrap_err();
        assert_eq!(failure.status, Some(400));
        assert_eq!(failure.error.as_deref(), Some("invalid_grant"));
        assert_eq!(failure.message, "Invalid refresh token");
    }

    #[tokio::test]
    async fn rate_limit_exposes_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth2/token")
            .with_status(429)
            .with_header("retry-after", "30")
            .with_body("{}")
            .create_async()
            .await;

        let refresher = TokenRefresher::new(format!("{}/oauth2/token", server.url()));
        let failure = refresher.refresh(&request()).await.unwrap_err();
        assert_eq!(failure.status, Some(429));
        assert_eq!(failure.retry_after, Some(30));
    }

    #[test]
    fn scheduling_uses_five_minute_floor() {
        let now = Utc::now();
        // One hour lifetime: 10% is 6 minutes, which beats the 5 minute floor
        let sched = calculate_refresh_scheduling(Some(now + Duration::hours(1)), now);
        assert!(sched.can_schedule);
        assert_eq!(sched.delay_ms, (54 * 60 * 1000) as u64);

        // Twenty minute lifetime: 10% is 2 minutes, the floor wins
        let sched = calculate_refresh_scheduling(Some(now + Duration::minutes(20)), now);
        assert_eq!(sched.delay_ms, (15 * 60 * 1000) as u64);
    }

    #[test]
    fn past_expiry_schedules_immediately() {
        let now = Utc::now();
        let sched = calculate_refresh_scheduling(Some(now + Duration::minutes(2)), now);
        assert!(sched.can_schedule);
        assert_eq!(sched.delay_ms, 0);

        let sched = calculate_refresh_scheduling(Some(now - Duration::minutes(2)), now);
        assert_eq!(sched.delay_ms, 0);
    }

    #[test]
    fn missing_expiry_cannot_schedule() {
        let sched = calculate_refresh_scheduling(None, Utc::now());
        assert!(!sched.can_schedule);
        assert!(sched.reason.is_some());
    }

    #[tokio::test]
    async fn auth_retry_refreshes_once_then_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let refreshes = Arc::new(AtomicU32::new(0));

        let calls_op = Arc::clone(&calls);
        let refreshes_cl = Arc::clone(&refreshes);
        let result = with_auth_retry(
            || {
                let calls = Arc::clone(&calls_op);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(PolychatError::new(ErrorCode::ApiAuthenticationFailed)
                            .message("401 from API")
                            .category(ErrorCategory::Authentication)
                            .build())
                    } else {
                        Ok("ok")
                    }
                }
            },
            || {
                let refreshes = Arc::clone(&refreshes_cl);
                async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_retry_surfaces_second_failure() {
        let result: PolychatResult<()> = with_auth_retry(
            || async {
                Err(PolychatError::new(ErrorCode::ApiAuthenticationFailed)
                    .message("401 from API")
                    .build())
            },
            || async { Ok(()) },
        )
        .await;
        assert!(result.is_err());
    }
}
