//! Duplicate EventSub notification suppression across reconnects.

use std::sync::Arc;
use tokio::sync::RwLock;

use polychat::platform::twitch::helix::HelixClient;
use polychat::platform::twitch::subscriptions::SubscriptionManager;

fn manager() -> SubscriptionManager {
    let helix = Arc::new(HelixClient::new(
        "http://127.0.0.1:9",
        "cid",
        Arc::new(RwLock::new(String::new())),
    ));
    SubscriptionManager::new(helix)
}

#[tokio::test]
async fn replayed_message_ids_are_dropped() {
    let subs = manager();

    assert!(!subs.is_duplicate("msg-1"));
    assert!(subs.is_duplicate("msg-1"));
    // Other ids are unaffected
    assert!(!subs.is_duplicate("msg-2"));
    assert!(subs.is_duplicate("msg-2"));
}

#[tokio::test]
async fn dedup_survives_a_large_id_stream() {
    let subs = manager();

    for i in 0..5000 {
        assert!(!subs.is_duplicate(&format!("msg-{}", i)));
    }
    // Recent ids are still remembered after thousands of inserts
    assert!(subs.is_duplicate("msg-4999"));
    assert!(subs.is_duplicate("msg-0"));
}
