//! End-to-end pipeline tests: raw driver events through the orchestrator's
//! normalize/validate pump and out on the event bus.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use polychat::events::schema::EventKind;
use polychat::orchestrator::{DriverFactory, Orchestrator};
use polychat::platform::{EventSink, PlatformDriver, PlatformKind, RawPlatformEvent};
use polychat::{Config, EventBus, StreamEvent};

struct ScriptedDriver {
    platform: PlatformKind,
    events: Vec<(EventKind, serde_json::Value)>,
    connected: AtomicBool,
}

#[async_trait]
impl PlatformDriver for ScriptedDriver {
    fn platform(&self) -> PlatformKind {
        self.platform
    }

    async fn initialize(&self, sink: EventSink) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        for (kind, payload) in &self.events {
            sink.send(RawPlatformEvent {
                platform: self.platform,
                kind: *kind,
                payload: payload.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct ScriptedFactory {
    drivers: HashMap<PlatformKind, Arc<ScriptedDriver>>,
}

impl DriverFactory for ScriptedFactory {
    fn create(&self, platform: PlatformKind) -> Result<Arc<dyn PlatformDriver>> {
        self.drivers
            .get(&platform)
            .cloned()
            .map(|d| d as Arc<dyn PlatformDriver>)
            .ok_or_else(|| anyhow::anyhow!("no driver for {}", platform))
    }
}

fn harness(
    platform: PlatformKind,
    events: Vec<(EventKind, serde_json::Value)>,
) -> (Arc<Orchestrator>, EventBus) {
    let mut config = Config::default();
    match platform {
        PlatformKind::Twitch => {
            config.platforms.twitch.enabled = true;
            config.platforms.twitch.client_id = "cid".to_string();
            config.platforms.twitch.client_secret = "secret".to_string();
        }
        PlatformKind::Youtube => {
            config.platforms.youtube.enabled = true;
            config.platforms.youtube.channel_id = Some("ch".to_string());
        }
        PlatformKind::Tiktok => {
            config.platforms.tiktok.enabled = true;
            config.platforms.tiktok.username = Some("host".to_string());
        }
    }

    let driver = Arc::new(ScriptedDriver {
        platform,
        events,
        connected: AtomicBool::new(false),
    });
    let mut drivers = HashMap::new();
    drivers.insert(platform, driver);

    let bus = EventBus::new(64);
    let orchestrator = Orchestrator::new(
        config,
        bus.clone(),
        Arc::new(ScriptedFactory { drivers }),
    );
    (orchestrator, bus)
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for bus event")
        .expect("bus closed")
}

#[tokio::test]
async fn twitch_follow_flows_end_to_end() {
    let (orchestrator, bus) = harness(
        PlatformKind::Twitch,
        vec![(
            EventKind::Follow,
            json!({
                "username": "new_follower",
                "userId": "12345",
                "followed_at": "2024-01-01T00:00:00Z",
            }),
        )],
    );
    let mut rx = bus.subscribe();

    orchestrator.start().await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.platform, PlatformKind::Twitch);
    assert_eq!(event.event_type(), "platform:follow");
    assert_eq!(event.data["username"], "new_follower");
    assert_eq!(event.data["userId"], "12345");
    assert_eq!(event.data["timestamp"], "2024-01-01T00:00:00.000Z");
    assert!(!event.id.is_empty());

    let status = orchestrator.get_status().await;
    assert_eq!(status.initialized_platforms, vec!["twitch"]);
    assert_eq!(status.event_bus.events_published, 1);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn tiktok_gift_normalizes_coins_and_timestamp() {
    let (orchestrator, bus) = harness(
        PlatformKind::Tiktok,
        vec![(
            EventKind::Gift,
            json!({
                "username": "g",
                "userId": "2",
                "id": "e1",
                "giftType": "rose",
                "giftCount": 1,
                "amount": 1,
                "currency": "coins",
                "common": { "createTime": 1_700_000_000 },
            }),
        )],
    );
    let mut rx = bus.subscribe();

    orchestrator.start().await.unwrap();
    // TikTok initializes in the background; start() does not wait for it
    orchestrator
        .join_background_init(Duration::from_secs(5))
        .await;

    let event = next_event(&mut rx).await;
    assert_eq!(event.platform, PlatformKind::Tiktok);
    assert_eq!(event.event_type(), "platform:gift");
    assert_eq!(event.data["giftType"], "rose");
    assert_eq!(event.data["amount"], 1);
    assert_eq!(event.data["currency"], "coins");
    // Seconds-precision createTime becomes a millisecond ISO timestamp
    assert_eq!(event.data["timestamp"], "2023-11-14T22:13:20.000Z");
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn invalid_events_are_dropped_without_stalling_the_pump() {
    let (orchestrator, bus) = harness(
        PlatformKind::Youtube,
        vec![
            // No userId: rejected by the normalizer
            (EventKind::Follow, json!({ "username": "incomplete" })),
            (
                EventKind::ChatMessage,
                json!({ "username": "@viewer", "userId": "abc", "message": "hi" }),
            ),
        ],
    );
    let mut rx = bus.subscribe();

    orchestrator.start().await.unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.event_type(), "platform:chat-message");
    // YouTube handles are stripped of their @ prefix
    assert_eq!(event.data["username"], "viewer");
    assert_eq!(event.data["message"]["text"], "hi");

    assert_eq!(orchestrator.get_status().await.event_bus.events_published, 1);
    orchestrator.shutdown().await;
}
