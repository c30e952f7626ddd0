pub mod tiktok;
pub mod twitch;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::events::schema::EventKind;

/// The platforms the core knows how to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Twitch,
    Youtube,
    Tiktok,
}

impl PlatformKind {
    pub const ALL: [PlatformKind; 3] =
        [PlatformKind::Twitch, PlatformKind::Youtube, PlatformKind::Tiktok];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Twitch => "twitch",
            PlatformKind::Youtube => "youtube",
            PlatformKind::Tiktok => "tiktok",
        }
    }

    /// Platforms whose drivers connect slowly and initialize in the background
    pub fn is_slow_connecting(&self) -> bool {
        matches!(self, PlatformKind::Tiktok)
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "twitch" => Ok(PlatformKind::Twitch),
            "youtube" => Ok(PlatformKind::Youtube),
            "tiktok" => Ok(PlatformKind::Tiktok),
            other => Err(anyhow::anyhow!("unknown platform: {}", other)),
        }
    }
}

/// A raw event produced by a platform driver, before normalization
#[derive(Debug, Clone)]
pub struct RawPlatformEvent {
    pub platform: PlatformKind,
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// Channel used by drivers to hand raw events to the orchestrator
pub type EventSink = mpsc::Sender<RawPlatformEvent>;

/// Adapter interface every platform driver implements.
///
/// Drivers own their SDK/protocol details; the orchestrator only sees
/// `initialize`, `cleanup`, and the raw event stream.
#[async_trait]
pub trait PlatformDriver: Send + Sync {
    fn platform(&self) -> PlatformKind;

    /// Connect and start producing raw events into the sink.
    async fn initialize(&self, sink: EventSink) -> Result<()>;

    /// Tear down connections and background tasks.
    async fn cleanup(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Whether the driver discovers its own live stream; when false the
    /// orchestrator runs an injected detector before initialization.
    fn detects_streams(&self) -> bool {
        true
    }
}
