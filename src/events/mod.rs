pub mod normalize;
pub mod schema;
pub mod timestamp;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, trace, warn};
use uuid::Uuid;

use crate::error::PolychatResult;
use crate::platform::PlatformKind;

fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Canonical event envelope flowing through the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Platform that generated the event
    pub platform: PlatformKind,
    /// Canonical event type string (e.g. "platform:chat-message")
    #[serde(rename = "type")]
    pub event_type: String,
    /// Normalized event payload
    pub data: serde_json::Value,
    /// Unique event ID
    #[serde(default = "generate_uuid")]
    pub id: String,
}

impl StreamEvent {
    pub fn new(platform: PlatformKind, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            platform,
            event_type: event_type.to_string(),
            data,
            id: generate_uuid(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }
}

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events successfully published
    pub events_published: u64,
    /// Number of events dropped (no receivers)
    pub events_dropped: u64,
    /// Count of events by platform
    pub platform_counts: HashMap<String, u64>,
    /// Count of events by type
    pub type_counts: HashMap<String, u64>,
}

/// Central event bus distributing normalized events to subscribers
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
    capacity: usize,
    stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating new event bus");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    /// Get a receiver to subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        trace!("New subscriber registered to event bus");
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning the receiver count.
    /// An event with no subscribers is counted as dropped, not an error.
    pub async fn publish(&self, event: StreamEvent) -> PolychatResult<usize> {
        let platform = event.platform.as_str().to_string();
        let event_type = event.event_type.clone();

        trace!(
            platform = %platform,
            event_type = %event_type,
            "Publishing event to bus"
        );

        match self.sender.send(event) {
            Ok(receivers) => {
                let mut stats = self.stats.write().await;
                stats.events_published += 1;
                *stats.platform_counts.entry(platform).or_insert(0) += 1;
                *stats.type_counts.entry(event_type).or_insert(0) += 1;
                Ok(receivers)
            }
            Err(err) => {
                if self.sender.receiver_count() == 0 {
                    let mut stats = self.stats.write().await;
                    stats.events_dropped += 1;

                    warn!(
                        platform = %platform,
                        event_type = %event_type,
                        "No receivers for event, message dropped"
                    );
                    Ok(0)
                } else {
                    error!(error = %err, "Failed to publish event");
                    Err(crate::error::event_bus_publish_failed(err))
                }
            }
        }
    }

    /// Get current event bus statistics
    pub async fn get_stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }

    /// Reset all statistics counters
    pub async fn reset_stats(&self) {
        info!("Resetting event bus statistics");
        *self.stats.write().await = EventBusStats::default();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
            stats: Arc::clone(&self.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let event = StreamEvent::new(
            PlatformKind::Twitch,
            "platform:follow",
            json!({ "username": "u", "userId": "1" }),
        );
        let receivers = bus.publish(event).await.unwrap();
        assert_eq!(receivers, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "platform:follow");
        assert_eq!(received.platform, PlatformKind::Twitch);
        assert!(!received.id.is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_counts_as_dropped() {
        let bus = EventBus::new(16);
        let event = StreamEvent::new(PlatformKind::Tiktok, "platform:gift", json!({}));
        let receivers = bus.publish(event).await.unwrap();
        assert_eq!(receivers, 0);

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_dropped, 1);
        assert_eq!(stats.events_published, 0);
    }

    #[tokio::test]
    async fn stats_track_platform_and_type() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();

        for _ in 0..3 {
            let event = StreamEvent::new(
                PlatformKind::Youtube,
                "platform:chat-message",
                json!({ "message": { "text": "hi" } }),
            );
            bus.publish(event).await.unwrap();
        }

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_published, 3);
        assert_eq!(stats.platform_counts.get("youtube"), Some(&3));
        assert_eq!(stats.type_counts.get("platform:chat-message"), Some(&3));

        bus.reset_stats().await;
        assert_eq!(bus.get_stats().await.events_published, 0);
    }

    #[tokio::test]
    async fn clones_share_channel_and_stats() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx = clone.subscribe();

        bus.publish(StreamEvent::new(
            PlatformKind::Twitch,
            "platform:health-check",
            json!({}),
        ))
        .await
        .unwrap();

        assert!(rx.recv().await.is_ok());
        assert_eq!(clone.get_stats().await.events_published, 1);
    }
}
