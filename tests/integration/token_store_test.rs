//! Token persistence: on-disk format, permissions, and refresh-token
//! inheritance across writes.

use polychat::auth::store::{TokenRecord, TokenStore};
use polychat::platform::PlatformKind;

fn record(access: &str, refresh: Option<&str>) -> TokenRecord {
    TokenRecord::new(access.to_string(), refresh.map(str::to_string))
}

#[test]
fn records_round_trip_in_camel_case() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));

    let mut rec = record("A1", Some("R1"));
    rec.expires_at = Some(1_700_000_000_000);
    let report = store.store(PlatformKind::Twitch, rec).unwrap();
    assert!(!report.degraded);

    // The wire format is camelCase with epoch-millisecond expiry
    let raw = std::fs::read_to_string(store.path()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["twitch"]["accessToken"], "A1");
    assert_eq!(parsed["twitch"]["refreshToken"], "R1");
    assert_eq!(parsed["twitch"]["expiresAt"], 1_700_000_000_000i64);

    let loaded = store.get(PlatformKind::Twitch).unwrap().unwrap();
    assert_eq!(loaded.access_token, "A1");
    assert_eq!(loaded.refresh_token.as_deref(), Some("R1"));
    assert_eq!(loaded.expires_at, Some(1_700_000_000_000));
}

#[cfg(unix)]
#[test]
fn token_file_is_owner_readable_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("secrets").join("tokens.json"));
    store
        .store(PlatformKind::Tiktok, record("A1", Some("R1")))
        .unwrap();

    let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
    assert_eq!(file_mode & 0o777, 0o600);

    let dir_mode = std::fs::metadata(store.path().parent().unwrap())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o700);
}

#[test]
fn refresh_token_is_inherited_when_a_new_record_lacks_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("tokens.json"));

    store
        .store(PlatformKind::Twitch, record("A1", Some("R1")))
        .unwrap();
    let report = store
        .store(PlatformKind::Twitch, record("A2", None))
        .unwrap();
    assert!(!report.degraded);

    let loaded = store.get(PlatformKind::Twitch).unwrap().unwrap();
    assert_eq!(loaded.access_token, "A2");
    assert_eq!(loaded.refresh_token.as_deref(), Some("R1"));

    // Nothing to inherit: the write succeeds but is flagged
    let report = store
        .store(PlatformKind::Youtube, record("B1", None))
        .unwrap();
    assert!(report.degraded);

    // Platforms are isolated
    assert!(store.clear(PlatformKind::Youtube).unwrap());
    assert!(store.get(PlatformKind::Twitch).unwrap().is_some());
}
