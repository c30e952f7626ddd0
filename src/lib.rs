pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod init;
pub mod orchestrator;
pub mod platform;
pub mod retry;
pub mod stats;
pub mod timer;

// Re-export core components
pub use crate::config::{Config, ConfigManager};
pub use crate::error::{PolychatError, PolychatResult};
pub use crate::events::{EventBus, StreamEvent};
pub use crate::orchestrator::{DefaultDriverFactory, Orchestrator};
pub use crate::platform::{PlatformDriver, PlatformKind, RawPlatformEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
