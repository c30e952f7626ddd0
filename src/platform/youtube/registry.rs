use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use anyhow::Result;

/// A live chat connection owned by the registry. `stop()` failures are
/// tolerated during teardown; `disconnect()` failures are not.
#[async_trait]
pub trait LiveChatConnection: Send + Sync {
    async fn stop(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Builds a connection for a video id
pub type ConnectionFactory<'a> =
    &'a (dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn LiveChatConnection>>> + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Ready,
    Disconnecting,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Milliseconds from CONNECTING to CONNECTED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_duration: Option<u64>,
}

struct ConnectionRecord {
    connection: Option<Arc<dyn LiveChatConnection>>,
    state: ConnectionState,
    metadata: ConnectionMetadata,
    ready: bool,
}

/// Point-in-time view of one record, for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    pub state: ConnectionState,
    pub ready: bool,
    pub metadata: ConnectionMetadata,
}

/// Tracks one live chat connection per video id with atomic connect and
/// disconnect. Failed connects leave an ERROR record behind so the id keeps
/// showing up in `active_video_ids` until someone removes it.
pub struct ConnectionRegistry {
    records: DashMap<String, ConnectionRecord>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    api_enabled: bool,
    scraping_enabled: bool,
}

impl ConnectionRegistry {
    pub fn new(api_enabled: bool, scraping_enabled: bool) -> Self {
        Self {
            records: DashMap::new(),
            locks: DashMap::new(),
            api_enabled,
            scraping_enabled,
        }
    }

    fn lock_for(&self, name: String) -> Arc<Mutex<()>> {
        self.locks
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn is_api_enabled(&self) -> bool {
        self.api_enabled
    }

    pub fn is_scraping_enabled(&self) -> bool {
        self.scraping_enabled
    }

    /// Connect to a video's live chat. Returns false without touching the
    /// record when one already exists (connecting included). On factory
    /// failure the record stays behind in ERROR.
    pub async fn connect(&self, video_id: &str, factory: ConnectionFactory<'_>) -> bool {
        let lock = self.lock_for(format!("connect_{}", video_id));
        let _guard = lock.lock().await;

        if self.records.contains_key(video_id) {
            debug!(video_id, "Connection already present, skipping");
            return false;
        }

        let started = Instant::now();
        self.records.insert(
            video_id.to_string(),
            ConnectionRecord {
                connection: None,
                state: ConnectionState::Connecting,
                metadata: ConnectionMetadata {
                    connected_at: Some(Utc::now()),
                    ..Default::default()
                },
                ready: false,
            },
        );

        match factory(video_id.to_string()).await {
            Ok(connection) => {
                let duration = started.elapsed().as_millis() as u64;
                if let Some(mut record) = self.records.get_mut(video_id) {
                    record.connection = Some(connection);
                    record.state = ConnectionState::Connected;
                    record.metadata.connection_duration = Some(duration);
                }
                info!(video_id, duration_ms = duration, "Live chat connected");
                true
            }
            Err(e) => {
                warn!(video_id, error = %e, "Live chat connection failed");
                if let Some(mut record) = self.records.get_mut(video_id) {
                    record.state = ConnectionState::Error;
                    record.metadata.error = Some(e.to_string());
                    record.metadata.error_code = Some("CONNECTION_FAILED".to_string());
                    record.metadata.failed_at = Some(Utc::now());
                }
                false
            }
        }
    }

    /// Disconnect and delete a record. `stop()` failures are logged and
    /// ignored; a `disconnect()` failure propagates and leaves the record.
    pub async fn disconnect(&self, video_id: &str, reason: &str) -> Result<bool> {
        let lock = self.lock_for(format!("disconnect_{}", video_id));
        let _guard = lock.lock().await;

        let connection = match self.records.get_mut(video_id) {
            Some(mut record) => {
                record.state = ConnectionState::Disconnecting;
                record.metadata.disconnect_reason = Some(reason.to_string());
                record.connection.clone()
            }
            None => return Ok(false),
        };

        if let Some(connection) = connection {
            if let Err(e) = connection.stop().await {
                warn!(video_id, error = %e, "Connection stop failed during disconnect");
            }
            connection.disconnect().await?;
        }

        self.records.remove(video_id);
        info!(video_id, reason, "Live chat disconnected");
        Ok(true)
    }

    /// CONNECTED → READY once the first poll succeeds
    pub fn set_connection_ready(&self, video_id: &str) -> bool {
        match self.records.get_mut(video_id) {
            Some(mut record) if record.state == ConnectionState::Connected => {
                record.state = ConnectionState::Ready;
                record.ready = true;
                true
            }
            _ => false,
        }
    }

    /// Lockless best-effort removal
    pub async fn remove_connection(&self, video_id: &str) {
        if let Some((_, record)) = self.records.remove(video_id) {
            if let Some(connection) = record.connection {
                if let Err(e) = connection.stop().await {
                    warn!(video_id, error = %e, "Connection stop failed during removal");
                }
            }
        }
    }

    /// Shut everything down without taking per-id locks
    pub async fn cleanup_all_connections(&self) {
        let ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
        info!("All live chat connections cleaned up");
    }

    /// Every tracked id, ERROR records included
    pub fn get_active_video_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn get_connection(&self, video_id: &str) -> Option<Arc<dyn LiveChatConnection>> {
        self.records
            .get(video_id)
            .and_then(|r| r.connection.clone())
    }

    pub fn snapshot(&self, video_id: &str) -> Option<RecordSnapshot> {
        self.records.get(video_id).map(|r| RecordSnapshot {
            state: r.state,
            ready: r.ready,
            metadata: r.metadata.clone(),
        })
    }
}
