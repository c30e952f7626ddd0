//! The 401 policy end to end: an unauthorized API call forces one token
//! refresh, the retried call succeeds, and the new tokens are persisted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use polychat::auth::refresh::{with_auth_retry, RefreshRequest, TokenRefresher};
use polychat::auth::store::{TokenRecord, TokenStore};
use polychat::error::{ErrorCategory, ErrorCode, PolychatError};
use polychat::platform::twitch::helix::HelixClient;
use polychat::platform::PlatformKind;

#[tokio::test]
async fn unauthorized_call_refreshes_once_and_retries() {
    let mut helix_server = mockito::Server::new_async().await;
    let mut auth_server = mockito::Server::new_async().await;

    let stale = helix_server
        .mock("GET", "/users")
        .match_header("authorization", "Bearer stale")
        .with_status(401)
        .with_body(r#"{"error":"Unauthorized","status":401,"message":"Invalid OAuth token"}"#)
        .expect(1)
        .create_async()
        .await;
    let fresh = helix_server
        .mock("GET", "/users")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(r#"{"data":[{"id":"1","login":"streamer"}]}"#)
        .expect(1)
        .create_async()
        .await;
    let token_exchange = auth_server
        .mock("POST", "/oauth2/token")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            mockito::Matcher::UrlEncoded("refresh_token".into(), "R1".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"access_token":"fresh","refresh_token":"R2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));
    store
        .store(
            PlatformKind::Twitch,
            TokenRecord::new("stale".to_string(), Some("R1".to_string())),
        )
        .unwrap();

    let access_token = Arc::new(RwLock::new("stale".to_string()));
    let helix = HelixClient::new(
        helix_server.url(),
        "cid",
        Arc::clone(&access_token),
    );
    let refresher = TokenRefresher::new(format!("{}/oauth2/token", auth_server.url()));

    let users = with_auth_retry(
        || helix.get_users(None),
        || async {
            let record = store
                .get(PlatformKind::Twitch)
                .map_err(|e| refresh_error(e.to_string()))?
                .ok_or_else(|| refresh_error("no stored tokens".to_string()))?;
            let refresh_token = record
                .refresh_token
                .ok_or_else(|| refresh_error("no refresh token".to_string()))?;

            let tokens = refresher
                .refresh(&RefreshRequest {
                    refresh_token,
                    client_id: "cid".to_string(),
                    client_secret: "secret".to_string(),
                })
                .await
                .map_err(|f| refresh_error(f.message))?;

            helix.set_access_token(tokens.access_token.clone()).await;
            store
                .store(
                    PlatformKind::Twitch,
                    TokenRecord::new(
                        tokens.access_token,
                        Some(tokens.refresh_token),
                    )
                    .with_expires_in(tokens.expires_in as i64),
                )
                .map_err(|e| refresh_error(e.to_string()))?;
            Ok(())
        },
    )
    .await
    .unwrap();

    assert_eq!(users["data"][0]["login"], "streamer");
    stale.assert_async().await;
    fresh.assert_async().await;
    token_exchange.assert_async().await;

    // The rotated tokens were persisted
    let record = store.get(PlatformKind::Twitch).unwrap().unwrap();
    assert_eq!(record.access_token, "fresh");
    assert_eq!(record.refresh_token.as_deref(), Some("R2"));
    assert!(record.expires_at.is_some());
}

#[tokio::test]
async fn non_auth_failures_do_not_trigger_a_refresh() {
    let mut helix_server = mockito::Server::new_async().await;
    let broken = helix_server
        .mock("GET", "/users")
        .with_status(500)
        .with_body(r#"{"message":"internal error"}"#)
        .expect(1)
        .create_async()
        .await;

    let helix = HelixClient::new(
        helix_server.url(),
        "cid",
        Arc::new(RwLock::new("token".to_string())),
    );
    let refreshes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&refreshes);

    let result = with_auth_retry(
        || helix.get_users(None),
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
    )
    .await;

    assert!(result.is_err());
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    broken.assert_async().await;
}

fn refresh_error(message: String) -> PolychatError {
    PolychatError::new(ErrorCode::AuthRefreshFailed)
        .message(message)
        .category(ErrorCategory::Authentication)
        .build()
}
