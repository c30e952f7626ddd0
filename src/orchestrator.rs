use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::normalize;
use crate::events::schema::{self, EventKind};
use crate::events::{EventBus, EventBusStats, StreamEvent};
use crate::init::InitializationManager;
use crate::platform::tiktok::TiktokDriver;
use crate::platform::twitch::TwitchDriver;
use crate::platform::youtube::YoutubeDriver;
use crate::platform::{EventSink, PlatformDriver, PlatformKind, RawPlatformEvent};
use crate::retry::{FailureDisposition, RetryScheduler};
use crate::stats::{PerfBucket, StatisticsCollector};
use crate::timer::TimerRegistry;
use crate::auth::store::TokenStore;
use crate::error::user_facing_message;

const RAW_CHANNEL_CAPACITY: usize = 256;
const HEALTH_INTERVAL_MS: u64 = 60_000;
/// How long shutdown waits for background platform inits before aborting them
const BACKGROUND_JOIN_DEADLINE: Duration = Duration::from_secs(30);

/// Builds platform drivers; injectable so tests can substitute fakes.
pub trait DriverFactory: Send + Sync {
    fn create(&self, platform: PlatformKind) -> Result<Arc<dyn PlatformDriver>>;
}

/// Production factory wiring each platform's driver from the configuration.
pub struct DefaultDriverFactory {
    config: Config,
    store: Arc<TokenStore>,
}

impl DefaultDriverFactory {
    pub fn new(config: Config) -> Result<Self> {
        let path = match &config.tokens.path {
            Some(path) => path.clone(),
            None => TokenStore::default_path()
                .ok_or_else(|| anyhow!("No config directory available for token storage"))?,
        };
        Ok(Self {
            config,
            store: Arc::new(TokenStore::new(path)),
        })
    }

    pub fn store(&self) -> Arc<TokenStore> {
        Arc::clone(&self.store)
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, platform: PlatformKind) -> Result<Arc<dyn PlatformDriver>> {
        match platform {
            PlatformKind::Twitch => Ok(Arc::new(TwitchDriver::new(
                self.config.twitch_config(),
                Arc::clone(&self.store),
            ))),
            PlatformKind::Youtube => Ok(Arc::new(YoutubeDriver::new(
                self.config.platforms.youtube.clone(),
            ))),
            PlatformKind::Tiktok => Ok(Arc::new(TiktokDriver::new(
                self.config.platforms.tiktok.clone(),
            ))),
        }
    }
}

/// Fallback live-stream detection for drivers that do not self-detect.
#[async_trait]
pub trait StreamDetector: Send + Sync {
    async fn detect(&self, platform: PlatformKind) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPlatform {
    pub name: String,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub initialized_platforms: Vec<String>,
    pub failed_platforms: Vec<FailedPlatform>,
    pub connection_times: HashMap<String, f64>,
    pub stream_statuses: HashMap<String, Value>,
    pub event_bus: EventBusStats,
}

/// Drives the whole platform lifecycle: gates initialization, owns the raw
/// event pump (normalize, validate, publish), tracks background inits for
/// slow platforms, and tears everything down in order.
pub struct Orchestrator {
    config: Config,
    bus: EventBus,
    factory: Arc<dyn DriverFactory>,
    detector: Option<Arc<dyn StreamDetector>>,
    timers: Arc<TimerRegistry>,
    retries: Arc<RetryScheduler>,
    stats: Arc<StatisticsCollector>,
    drivers: DashMap<PlatformKind, Arc<dyn PlatformDriver>>,
    init_managers: DashMap<PlatformKind, Arc<InitializationManager>>,
    failed: DashMap<PlatformKind, String>,
    connection_times: DashMap<PlatformKind, f64>,
    stream_statuses: DashMap<PlatformKind, Value>,
    background: Mutex<Vec<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    raw_tx: RwLock<Option<EventSink>>,
}

impl Orchestrator {
    pub fn new(config: Config, bus: EventBus, factory: Arc<dyn DriverFactory>) -> Arc<Self> {
        Self::build(config, bus, factory, None)
    }

    pub fn with_detector(
        config: Config,
        bus: EventBus,
        factory: Arc<dyn DriverFactory>,
        detector: Arc<dyn StreamDetector>,
    ) -> Arc<Self> {
        Self::build(config, bus, factory, Some(detector))
    }

    fn build(
        config: Config,
        bus: EventBus,
        factory: Arc<dyn DriverFactory>,
        detector: Option<Arc<dyn StreamDetector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            factory,
            detector,
            timers: Arc::new(TimerRegistry::new()),
            retries: Arc::new(RetryScheduler::new()),
            stats: Arc::new(StatisticsCollector::new()),
            drivers: DashMap::new(),
            init_managers: DashMap::new(),
            failed: DashMap::new(),
            connection_times: DashMap::new(),
            stream_statuses: DashMap::new(),
            background: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
            raw_tx: RwLock::new(None),
        })
    }

    pub fn stats(&self) -> Arc<StatisticsCollector> {
        Arc::clone(&self.stats)
    }

    pub fn retries(&self) -> Arc<RetryScheduler> {
        Arc::clone(&self.retries)
    }

    pub fn timers(&self) -> Arc<TimerRegistry> {
        Arc::clone(&self.timers)
    }

    fn init_manager(&self, platform: PlatformKind) -> Arc<InitializationManager> {
        self.init_managers
            .entry(platform)
            .or_insert_with(|| Arc::new(InitializationManager::new(platform.as_str())))
            .clone()
    }

    /// Start the pump and initialize every enabled platform. Slow-connecting
    /// platforms run in tracked background tasks; everything else completes
    /// before this returns. Per-platform failures are recorded, not fatal.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        *self.raw_tx.write().await = Some(raw_tx.clone());
        let pump = tokio::spawn(Arc::clone(self).pump_events(raw_rx));
        match self.pump.lock() {
            Ok(mut slot) => {
                if let Some(previous) = slot.replace(pump) {
                    previous.abort();
                }
            }
            Err(poisoned) => {
                if let Some(previous) = poisoned.into_inner().replace(pump) {
                    previous.abort();
                }
            }
        }

        self.start_health_timer();

        for platform in self.config.enabled_platforms() {
            let manager = self.init_manager(platform);
            if !manager.begin_initialization(false) {
                self.stats.record_prevented(platform);
                info!(platform = %platform, "Initialization prevented by gating");
                continue;
            }

            let driver = match self.factory.create(platform) {
                Ok(driver) => driver,
                Err(e) => {
                    let message = format!("Driver construction failed: {}", e);
                    manager.mark_initialization_failure(&message, json!({}));
                    self.record_platform_failure(platform, &message);
                    continue;
                }
            };
            self.drivers.insert(platform, Arc::clone(&driver));

            if platform.is_slow_connecting() {
                info!(platform = %platform, "Initializing in background");
                let task = tokio::spawn(Arc::clone(self).initialize_platform(
                    platform,
                    driver,
                    raw_tx.clone(),
                ));
                match self.background.lock() {
                    Ok(mut tasks) => tasks.push(task),
                    Err(poisoned) => poisoned.into_inner().push(task),
                }
            } else {
                Arc::clone(self)
                    .initialize_platform(platform, driver, raw_tx.clone())
                    .await;
            }
        }
        Ok(())
    }

    fn initialize_platform(
        self: Arc<Self>,
        platform: PlatformKind,
        driver: Arc<dyn PlatformDriver>,
        sink: EventSink,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.stats.record_attempt(platform);
            let started = Instant::now();

            if !driver.detects_streams() {
                match &self.detector {
                    Some(detector) => match detector.detect(platform).await {
                        Ok(payload) => {
                            let _ = sink
                                .send(RawPlatformEvent {
                                    platform,
                                    kind: EventKind::StreamDetected,
                                    payload,
                                })
                                .await;
                        }
                        Err(e) => {
                            let message = format!("Stream detection failed: {}", e);
                            self.fail_initialization(platform, &message);
                            return;
                        }
                    },
                    None => {
                        let message =
                            "No stream detection available for this platform".to_string();
                        self.fail_initialization(platform, &message);
                        return;
                    }
                }
            }

            match driver.initialize(sink.clone()).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as f64;
                    self.init_manager(platform)
                        .mark_initialization_success(json!({ "durationMs": elapsed_ms }));
                    self.stats.record_success(platform, elapsed_ms);
                    self.stats
                        .record_timing(platform, PerfBucket::ConnectionTime, elapsed_ms);
                    self.connection_times.insert(platform, elapsed_ms);
                    self.failed.remove(&platform);
                    self.retries.record_success(platform);
                    info!(platform = %platform, duration_ms = elapsed_ms, "Platform initialized");
                }
                Err(e) => {
                    let message = e.to_string();
                    self.fail_initialization(platform, &message);
                    self.schedule_retry(platform, driver, sink, &message);
                }
            }
        })
    }

    fn fail_initialization(&self, platform: PlatformKind, message: &str) {
        let friendly = user_facing_message(message);
        error!(
            platform = %platform,
            error = message,
            title = %friendly.title,
            "Platform initialization failed"
        );
        self.init_manager(platform)
            .mark_initialization_failure(message, json!({}));
        self.record_platform_failure(platform, message);
    }

    fn record_platform_failure(&self, platform: PlatformKind, message: &str) {
        self.stats
            .record_failure(platform, message, "initialization");
        self.failed.insert(platform, message.to_string());
    }

    fn schedule_retry(
        self: &Arc<Self>,
        platform: PlatformKind,
        driver: Arc<dyn PlatformDriver>,
        sink: EventSink,
        message: &str,
    ) {
        match self.retries.record_failure(platform, message) {
            FailureDisposition::Stop => {
                warn!(platform = %platform, "Not retrying: authorization required");
            }
            FailureDisposition::Retry { attempt, delay } => {
                debug!(platform = %platform, attempt, "Retrying initialization");
                let orchestrator = Arc::clone(self);
                let guard_driver = Arc::clone(&driver);
                self.retries.schedule_reconnect(
                    platform,
                    delay,
                    move || guard_driver.is_connected(),
                    move || {
                        Box::pin(async move {
                            let manager = orchestrator.init_manager(platform);
                            if !manager.begin_initialization(false) {
                                orchestrator.stats.record_prevented(platform);
                                return;
                            }
                            orchestrator
                                .initialize_platform(platform, driver, sink)
                                .await;
                        })
                    },
                );
            }
        }
    }

    /// Convert raw driver events into canonical bus events. Malformed events
    /// are dropped here; the pipeline never stops on one.
    async fn pump_events(self: Arc<Self>, mut raw_rx: mpsc::Receiver<RawPlatformEvent>) {
        while let Some(raw) = raw_rx.recv().await {
            let data = match normalize::normalize(raw.kind, raw.platform, &raw.payload) {
                Ok(data) => data,
                Err(e) => {
                    debug!(
                        platform = %raw.platform,
                        kind = %raw.kind,
                        error = %e,
                        "Dropping unnormalizable event"
                    );
                    continue;
                }
            };

            let report = schema::validate(&data);
            if !report.valid {
                warn!(
                    platform = %raw.platform,
                    kind = %raw.kind,
                    errors = ?report.errors,
                    "Dropping schema-invalid event"
                );
                continue;
            }

            if raw.kind == EventKind::StreamStatus {
                self.stream_statuses.insert(raw.platform, data.clone());
            }

            let event = StreamEvent::new(raw.platform, raw.kind.as_str(), data);
            if let Err(e) = self.bus.publish(event).await {
                error!(error = %e, "Event bus publish failed");
            }
        }
        debug!("Raw event pump finished");
    }

    fn start_health_timer(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        self.timers.create_interval(
            "orchestrator_health",
            Arc::new(move || {
                let orchestrator = Arc::clone(&orchestrator);
                // Snapshot before the async block so no map guard is held
                // across an await
                let drivers: Vec<(PlatformKind, Arc<dyn PlatformDriver>)> = orchestrator
                    .drivers
                    .iter()
                    .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                    .collect();
                Box::pin(async move {
                    for (platform, driver) in drivers {
                        let payload = normalize::build_system_event(
                            EventKind::HealthCheck,
                            platform,
                            json!({
                                "isConnected": driver.is_connected(),
                                "healthy": orchestrator.stats.is_healthy(platform),
                            }),
                        );
                        let event =
                            StreamEvent::new(platform, EventKind::HealthCheck.as_str(), payload);
                        let _ = orchestrator.bus.publish(event).await;
                    }
                })
            }),
            HEALTH_INTERVAL_MS,
            "system",
            "orchestrator health broadcast",
        );
    }

    /// Wait for tracked background initializations, aborting stragglers at
    /// the deadline.
    pub async fn join_background_init(&self, deadline: Duration) {
        let tasks: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            let aborter = task.abort_handle();
            if timeout(deadline, task).await.is_err() {
                warn!("Background initialization exceeded deadline, aborting");
                aborter.abort();
            }
        }
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let initialized_platforms = self
            .init_managers
            .iter()
            .filter(|entry| entry.value().is_initialized())
            .map(|entry| entry.key().as_str().to_string())
            .collect();
        let failed_platforms = self
            .failed
            .iter()
            .map(|entry| FailedPlatform {
                name: entry.key().as_str().to_string(),
                last_error: entry.value().clone(),
            })
            .collect();
        let connection_times = self
            .connection_times
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
            .collect();
        let stream_statuses = self
            .stream_statuses
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), entry.value().clone()))
            .collect();

        OrchestratorStatus {
            initialized_platforms,
            failed_platforms,
            connection_times,
            stream_statuses,
            event_bus: self.bus.get_stats().await,
        }
    }

    /// Orderly teardown: drivers first, then timers, then pending retries,
    /// then background tasks and the pump.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        for entry in self.drivers.iter() {
            if let Err(e) = entry.value().cleanup().await {
                warn!(platform = %entry.key(), error = %e, "Driver cleanup failed");
            }
        }
        self.timers.cleanup();
        self.retries.cancel_all();

        self.join_background_init(BACKGROUND_JOIN_DEADLINE).await;
        *self.raw_tx.write().await = None;
        let pump = match self.pump.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("Orchestrator shut down");
    }
}
