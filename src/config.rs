use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::platform::tiktok::TiktokConfig;
use crate::platform::twitch::TwitchConfig;
use crate::platform::youtube::YoutubeConfig;

const DEFAULT_CALLBACK_PORT: u16 = 3000;
const DEFAULT_PORT_RANGE: u16 = 10;
const DEFAULT_EVENT_BUS_CAPACITY: usize = 1000;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2000;
const DEFAULT_RETRY_MULTIPLIER: f64 = 1.3;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Main configuration struct for polychat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-platform connection settings
    #[serde(default)]
    pub platforms: PlatformsConfig,
    /// OAuth callback server settings
    #[serde(default)]
    pub oauth: OAuthConfig,
    /// Reconnect backoff settings
    #[serde(default)]
    pub retry: RetryConfig,
    /// Token store settings
    #[serde(default)]
    pub tokens: TokensConfig,
    /// Event bus settings
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub twitch: TwitchSection,
    #[serde(default)]
    pub youtube: YoutubeConfig,
    #[serde(default)]
    pub tiktok: TiktokConfig,
}

/// Twitch credentials and channel selection. Client id/secret fall back to
/// environment variables so they can stay out of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchSection {
    pub enabled: bool,
    pub channel_login: Option<String>,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for TwitchSection {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_login: None,
            client_id: default_twitch_client_id(),
            client_secret: default_twitch_client_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// First port tried for the loopback callback server
    pub callback_port: u16,
    /// Number of consecutive ports probed when the first is taken
    pub port_range: u16,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_port: default_callback_port(),
            port_range: DEFAULT_PORT_RANGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// 0 means unlimited attempts
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// Override for the token file location
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_bus_capacity(),
        }
    }
}

// Default functions

fn default_twitch_client_id() -> String {
    std::env::var("POLYCHAT_TWITCH_CLIENT_ID").unwrap_or_default()
}

fn default_twitch_client_secret() -> String {
    std::env::var("POLYCHAT_TWITCH_CLIENT_SECRET").unwrap_or_default()
}

fn default_callback_port() -> u16 {
    std::env::var("POLYCHAT_CALLBACK_PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_CALLBACK_PORT)
}

fn default_event_bus_capacity() -> usize {
    std::env::var("POLYCHAT_EVENT_BUS_CAPACITY")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_EVENT_BUS_CAPACITY)
}

impl Config {
    /// Build the Twitch driver config from the twitch section
    pub fn twitch_config(&self) -> TwitchConfig {
        let section = &self.platforms.twitch;
        let mut config = TwitchConfig::new(&section.client_id, &section.client_secret);
        config.channel_login = section.channel_login.clone();
        config
    }

    /// Reject configurations that cannot possibly run
    pub fn validate(&self) -> Result<()> {
        let twitch = &self.platforms.twitch;
        if twitch.enabled && (twitch.client_id.is_empty() || twitch.client_secret.is_empty()) {
            bail!("Twitch is enabled but client_id/client_secret are not set");
        }
        let youtube = &self.platforms.youtube;
        if youtube.enabled && youtube.channel_id.is_none() {
            bail!("YouTube is enabled but no channel_id is configured");
        }
        if youtube.enabled && youtube.api_key.is_none() && !youtube.enable_scraping {
            bail!("YouTube is enabled with neither an API key nor scraping");
        }
        let tiktok = &self.platforms.tiktok;
        if tiktok.enabled && tiktok.username.is_none() {
            bail!("TikTok is enabled but no username is configured");
        }
        if self.retry.base_delay_ms == 0 || self.retry.multiplier < 1.0 {
            bail!("Retry settings must use a positive base delay and multiplier >= 1");
        }
        if self.event_bus.capacity == 0 {
            bail!("Event bus capacity must be positive");
        }
        Ok(())
    }

    pub fn enabled_platforms(&self) -> Vec<crate::platform::PlatformKind> {
        use crate::platform::PlatformKind;
        let mut platforms = Vec::new();
        if self.platforms.twitch.enabled {
            platforms.push(PlatformKind::Twitch);
        }
        if self.platforms.youtube.enabled {
            platforms.push(PlatformKind::Youtube);
        }
        if self.platforms.tiktok.enabled {
            platforms.push(PlatformKind::Tiktok);
        }
        platforms
    }
}

/// Manages configuration for the application
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub async fn new() -> Result<Self> {
        let config_path = get_config_path()?;
        Self::with_path(config_path).await
    }

    pub async fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = load_or_create_config(&config_path).await?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a clone of the current configuration
    pub async fn get_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Update the configuration
    pub async fn update_config(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;
        *self.config.write().await = new_config.clone();
        save_config(&self.config_path, &new_config).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Load the application configuration
pub async fn load_config() -> Result<Config> {
    let config_manager = ConfigManager::new().await?;
    Ok(config_manager.get_config().await)
}

/// Get the path to the configuration file
fn get_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POLYCHAT_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }
    if let Some(user_config_dir) = dirs::config_dir() {
        let config_dir = user_config_dir.join("polychat");
        std::fs::create_dir_all(&config_dir)?;
        return Ok(config_dir.join("config.json"));
    }
    Ok(PathBuf::from("config.json"))
}

/// Load configuration from file or create default
async fn load_or_create_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let default_config = Config::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: Config = serde_json::from_str(&config_str)?;
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Save configuration to file
async fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn enabled_twitch_requires_credentials() {
        let mut config = Config::default();
        config.platforms.twitch.enabled = true;
        config.platforms.twitch.client_id = String::new();
        config.platforms.twitch.client_secret = String::new();
        assert!(config.validate().is_err());

        config.platforms.twitch.client_id = "cid".to_string();
        config.platforms.twitch.client_secret = "secret".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn enabled_youtube_requires_a_detection_path() {
        let mut config = Config::default();
        config.platforms.youtube.enabled = true;
        assert!(config.validate().is_err());

        config.platforms.youtube.channel_id = Some("ch".to_string());
        config.platforms.youtube.enable_scraping = false;
        assert!(config.validate().is_err());

        config.platforms.youtube.enable_scraping = true;
        config.validate().unwrap();
    }

    #[test]
    fn enabled_platform_list_matches_flags() {
        use crate::platform::PlatformKind;
        let mut config = Config::default();
        assert!(config.enabled_platforms().is_empty());

        config.platforms.tiktok.enabled = true;
        config.platforms.tiktok.username = Some("host".to_string());
        assert_eq!(config.enabled_platforms(), vec![PlatformKind::Tiktok]);
    }

    #[tokio::test]
    async fn load_or_create_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        // First load creates the default file
        let manager = ConfigManager::with_path(path.clone()).await.unwrap();
        assert!(path.exists());

        let mut config = manager.get_config().await;
        config.platforms.tiktok.enabled = true;
        config.platforms.tiktok.username = Some("host".to_string());
        manager.update_config(config).await.unwrap();

        let reloaded = ConfigManager::with_path(path).await.unwrap();
        let config = reloaded.get_config().await;
        assert!(config.platforms.tiktok.enabled);
        assert_eq!(config.platforms.tiktok.username.as_deref(), Some("host"));
    }

    #[tokio::test]
    async fn invalid_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"))
            .await
            .unwrap();

        let mut config = manager.get_config().await;
        config.event_bus.capacity = 0;
        assert!(manager.update_config(config).await.is_err());
    }
}
