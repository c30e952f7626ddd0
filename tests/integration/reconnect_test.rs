//! Reconnect exhaustion: a connection that keeps failing is retried with
//! backoff until the attempt cap, then abandoned.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use polychat::events::schema::EventKind;
use polychat::platform::tiktok::{TiktokConfig, WebcastClient};
use polychat::platform::RawPlatformEvent;

async fn refused_ws_url() -> String {
    // Bind then drop so the port is known to refuse connections
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_abandon_the_connection() {
    let config = TiktokConfig {
        enabled: true,
        username: Some("host".to_string()),
        webcast_url: refused_ws_url().await,
        max_retry_attempts: 3,
    };
    let (tx, mut rx) = mpsc::channel::<RawPlatformEvent>(32);
    let client: Arc<WebcastClient> = WebcastClient::new(config, tx);

    assert!(client.initialize().await.is_err());
    assert!(client.is_initialized());
    client.schedule_reconnect().await;

    // Paused clock: the backoff delays elapse virtually, so this resolves
    // quickly in real time
    let abandoned = timeout(Duration::from_secs(3600), async {
        loop {
            let event = rx.recv().await.expect("sink closed");
            if event.kind == EventKind::Connection && event.payload["state"] == "abandoned" {
                return event;
            }
        }
    })
    .await
    .expect("never abandoned");

    assert_eq!(abandoned.payload["state"], "abandoned");
    assert_eq!(client.retry_attempts(), 3);
    assert!(!client.is_initialized());
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnect_stops_when_the_client_is_stopped() {
    let config = TiktokConfig {
        enabled: true,
        username: Some("host".to_string()),
        webcast_url: refused_ws_url().await,
        max_retry_attempts: 50,
    };
    let (tx, mut rx) = mpsc::channel::<RawPlatformEvent>(32);
    let client: Arc<WebcastClient> = WebcastClient::new(config, tx);

    assert!(client.initialize().await.is_err());
    client.schedule_reconnect().await;
    client.stop().await;

    // With the pending reconnect aborted, no abandoned event ever arrives
    let result = timeout(Duration::from_secs(600), async {
        loop {
            let event = rx.recv().await.expect("sink closed");
            if event.kind == EventKind::Connection && event.payload["state"] == "abandoned" {
                return;
            }
        }
    })
    .await;
    assert!(result.is_err());
    assert!(!client.is_initialized());
}
