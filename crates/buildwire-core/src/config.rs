// ABOUTME: Configuration loading and management for buildwire
// ABOUTME: TOML config under the XDG config dir with per-section defaults

use anyhow::{Context, Result};
use buildwire_proto::Actor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildwireConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub retry: RetryConfig,
    pub continuation: ContinuationConfig,
    pub dispatcher: DispatcherConfig,
    pub threads: ThreadsConfig,
    pub identity: IdentityConfig,
    /// External code generator used by the CLI host
    pub generator: GeneratorConfig,
    /// Archive of finished threads used by the CLI host
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server endpoint, e.g. wss://host/ws
    pub url: String,
    /// Send a heartbeat after this long without outbound traffic
    pub heartbeat_interval_secs: u64,
    /// Connection is stale after this many heartbeat intervals without inbound traffic
    pub liveness_multiplier: u32,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            heartbeat_interval_secs: 30,
            liveness_multiplier: 3,
            connect_timeout_secs: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval()
            .checked_mul(self.liveness_multiplier.max(1))
            .unwrap_or(Duration::MAX)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    /// Give up after this many consecutive failed attempts (None retries forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.25,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter_ratio)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total send attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Backoff::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            ),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    /// Deadline for a reply when the caller gives none
    pub default_deadline_secs: u64,
    /// How often expired continuations are swept
    pub sweep_interval_secs: u64,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            default_deadline_secs: 300,
            sweep_interval_secs: 1,
        }
    }
}

impl ContinuationConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bound of the queue between the connection reader and the router
    pub queue_capacity: usize,
    /// Threads processed in parallel
    pub max_concurrent: usize,
    /// Per-thread workers exit after this long without messages
    pub worker_idle_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_concurrent: 8,
            worker_idle_secs: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    /// Snapshots of archived threads kept in memory for stale detection
    pub archive_retention: usize,
    /// Quiet period after which a conversation with nothing outstanding is archived
    pub idle_archive_secs: u64,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            archive_retention: 1024,
            idle_archive_secs: 600,
        }
    }
}

impl ThreadsConfig {
    pub fn idle_archive(&self) -> Duration {
        Duration::from_secs(self.idle_archive_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Actor this process speaks as
    pub actor: Actor,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            actor: Actor::System,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Program invoked per build request (None disables building)
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON-lines file for finished threads
    pub path: Option<PathBuf>,
}

impl BuildwireConfig {
    /// Get the XDG config directory for buildwire (~/.config/buildwire)
    pub fn config_dir() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("buildwire")
    }

    /// Get the XDG data directory for buildwire (~/.local/share/buildwire)
    pub fn data_dir() -> PathBuf {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".local").join("share"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("buildwire")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: BuildwireConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Get the thread archive path, using default if not configured
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("threads.jsonl"))
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# buildwire configuration
# Location: ~/.config/buildwire/config.toml

[connection]
url = "ws://127.0.0.1:8080/ws"
heartbeat_interval_secs = 30
liveness_multiplier = 3
connect_timeout_secs = 10

[reconnect]
base_delay_ms = 500
max_delay_ms = 30000
jitter_ratio = 0.25
# max_attempts = 20  # Unset retries forever

[retry]
max_attempts = 3
base_delay_ms = 200
max_delay_ms = 2000

[continuation]
default_deadline_secs = 300
sweep_interval_secs = 1

[dispatcher]
queue_capacity = 100
max_concurrent = 8
worker_idle_secs = 60

[threads]
archive_retention = 1024
idle_archive_secs = 600

[identity]
actor = "System"

[generator]
# command = "my-codegen"
# args = ["--json"]
timeout_secs = 600

[store]
# path = "~/.local/share/buildwire/threads.jsonl"  # Default location
"#
        .to_string()
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }

    /// Write this config to a path as TOML
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}
