//! Configuration loading for agentmesh.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "AGENTMESH_HOME";

/// Get the agentmesh home directory (~/.agentmesh unless overridden).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmesh"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from an explicit path, or from the home directory.
///
/// A missing file is not an error: defaults apply.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => get_settings_path()?,
    };

    if !path.exists() {
        tracing::debug!("No settings at {}, using defaults", path.display());
        let settings = Settings::default();
        validate_settings(&settings)?;
        return Ok(settings);
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.tasks.worker_pool_size == 0 {
        return Err(Error::Config("tasks.worker_pool_size must be at least 1".to_string()));
    }
    if settings.retry.max_attempts == 0 {
        return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
    }
    if settings.retry.max_delay_ms < settings.retry.base_delay_ms {
        return Err(Error::Config(
            "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&settings.retry.jitter_ratio) {
        return Err(Error::Config("retry.jitter_ratio must be within 0..=1".to_string()));
    }
    if settings.breaker.failure_threshold == 0 {
        return Err(Error::Config("breaker.failure_threshold must be at least 1".to_string()));
    }
    if settings.router.missed_heartbeats == 0 || settings.router.heartbeat_interval_ms == 0 {
        return Err(Error::Config(
            "router heartbeat interval and missed_heartbeats must be non-zero".to_string(),
        ));
    }
    if settings.messages.max_message_bytes == 0 {
        return Err(Error::Config("messages.max_message_bytes must be non-zero".to_string()));
    }
    Ok(())
}

/// Message limits.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MessageSettings {
    pub max_message_bytes: usize,
    pub default_delivery_deadline_ms: u64,
    /// How long delivered messages stay in a mailbox.
    pub retention_ms: u64,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: crate::protocol::DEFAULT_MAX_MESSAGE_BYTES,
            default_delivery_deadline_ms: 30_000,
            retention_ms: 3_600_000,
        }
    }
}

impl MessageSettings {
    pub fn delivery_deadline(&self) -> Duration {
        Duration::from_millis(self.default_delivery_deadline_ms)
    }
}

/// Router liveness settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RouterSettings {
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeats: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            missed_heartbeats: 3,
        }
    }
}

impl RouterSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which an agent is presumed dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats
    }
}

/// Task manager settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TaskSettings {
    pub worker_pool_size: usize,
    pub default_timeout_ms: u64,
    pub cancel_grace_ms: u64,
    /// How long finished tasks stay queryable before eviction.
    pub retention_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            default_timeout_ms: 60_000,
            cancel_grace_ms: 2_000,
            retention_ms: 3_600_000,
        }
    }
}

impl TaskSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Retry/backoff settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Circuit breaker settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Storage locations and checkpoint retention.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct StorageSettings {
    /// Defaults to `<home>/data`.
    pub data_dir: Option<PathBuf>,
    pub checkpoint_max_age_secs: Option<u64>,
    pub checkpoint_max_per_subject: Option<usize>,
}

impl StorageSettings {
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("data")),
        }
    }
}

/// HTTP API settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3333,
        }
    }
}

/// agentmesh settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub messages: MessageSettings,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub tasks: TaskSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub web: WebSettings,
}
