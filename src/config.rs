//! Plugin configuration.
//!
//! This module defines the configuration surface the runtime consumes. Values
//! arrive from three layered sources, later sources winning: built-in
//! defaults, a TOML config file, and `PLUGIN_`-prefixed environment variables
//! (nested fields separated by `__`, e.g. `PLUGIN_SETTINGS__MODE=serial`).
//!
//! Durations are expressed as integer `*_ms`/`*_secs` fields. The runtime
//! only ever sees values that passed [`PluginConfig::validate`]; semantic
//! errors (zero intervals, empty addresses, a zero-size write queue) abort
//! startup rather than surfacing at runtime.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::{PluginError, PluginResult};

/// Default config file path, used when no explicit path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// How the scheduler runs its read and write loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Handler invocations within a tick run concurrently.
    #[default]
    Parallel,
    /// Handler invocations run sequentially and a tick waits for the
    /// previous one to drain.
    Serial,
}

/// Top-level plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// Plugin version string reported by the Version RPC.
    pub version: String,
    /// Raise the log level to debug.
    pub debug: bool,
    /// Runtime behavior settings.
    pub settings: PluginSettings,
    /// Network settings for the RPC listener.
    pub network: NetworkSettings,
}

/// Runtime behavior settings consumed by the scheduler and stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginSettings {
    pub mode: RunMode,
    pub read: ReadSettings,
    pub write: WriteSettings,
    pub listen: ListenSettings,
    /// Optional rate limit applied to every handler invocation.
    pub limiter: Option<LimiterSettings>,
    pub transaction: TransactionSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadSettings {
    /// Disable the read loop entirely.
    pub disable: bool,
    /// Time between read ticks, in milliseconds.
    pub interval_ms: u64,
    /// Delay before the first tick, in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            disable: false,
            interval_ms: 1_000,
            delay_ms: 0,
        }
    }
}

impl ReadSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriteSettings {
    /// Disable the write loop entirely.
    pub disable: bool,
    /// Time between write ticks, in milliseconds.
    pub interval_ms: u64,
    /// Delay before the first tick, in milliseconds.
    pub delay_ms: u64,
    /// Capacity of the bounded write queue.
    pub queue_size: usize,
    /// Maximum writes processed per tick.
    pub batch_size: usize,
    /// Fallback write deadline for devices without their own, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            disable: false,
            interval_ms: 1_000,
            delay_ms: 0,
            queue_size: 100,
            batch_size: 128,
            timeout_ms: 30_000,
        }
    }
}

impl WriteSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSettings {
    /// Disable listener tasks entirely.
    pub disable: bool,
}

/// Token-bucket rate limit over handler invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterSettings {
    /// Sustained rate, in invocations per second.
    pub rate: f64,
    /// Maximum burst size. Zero means "same as rate".
    pub burst: f64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            rate: 0.0,
            burst: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionSettings {
    /// Seconds a transaction record is retained after creation.
    pub ttl_secs: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl TransactionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Settings for the historical readings cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Enable the per-device readings cache ring.
    pub enabled: bool,
    /// Seconds a cached reading is retained.
    pub ttl_secs: u64,
    /// Maximum cached read contexts per device.
    pub size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 180,
            size: 128,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// How the RPC listener binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSettings {
    #[serde(rename = "type")]
    pub kind: NetworkType,
    /// `host:port` for tcp; a socket path (or bare file name resolved under
    /// the socket directory) for unix.
    pub address: String,
    /// TLS material handed to the transport layer. The core does not use it.
    pub tls: Option<TlsNetworkSettings>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            kind: NetworkType::Tcp,
            address: "0.0.0.0:5001".to_string(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsNetworkSettings {
    pub cert: String,
    pub key: String,
    pub ca_certs: Vec<String>,
    pub skip_verify: bool,
}

impl PluginConfig {
    /// Load configuration by merging defaults, the given TOML file (if it
    /// exists), and `PLUGIN_` environment variables.
    pub fn load(path: impl AsRef<Path>) -> PluginResult<Self> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(PluginConfig::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        // PLUGIN_CONFIG names the config file itself, not a config key.
        let config: PluginConfig = figment
            .merge(Env::prefixed("PLUGIN_").ignore(&["config"]).split("__"))
            .extract()
            .map_err(|e| PluginError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation of configuration values.
    pub fn validate(&self) -> PluginResult<()> {
        if !self.settings.read.disable && self.settings.read.interval_ms == 0 {
            return Err(PluginError::Config(
                "settings.read.interval_ms must be greater than zero".into(),
            ));
        }
        if !self.settings.write.disable {
            if self.settings.write.interval_ms == 0 {
                return Err(PluginError::Config(
                    "settings.write.interval_ms must be greater than zero".into(),
                ));
            }
            if self.settings.write.queue_size == 0 {
                return Err(PluginError::Config(
                    "settings.write.queue_size must be greater than zero".into(),
                ));
            }
            if self.settings.write.batch_size == 0 {
                return Err(PluginError::Config(
                    "settings.write.batch_size must be greater than zero".into(),
                ));
            }
        }
        if let Some(limiter) = &self.settings.limiter {
            if limiter.rate <= 0.0 {
                return Err(PluginError::Config(
                    "settings.limiter.rate must be greater than zero".into(),
                ));
            }
            if limiter.burst < 0.0 {
                return Err(PluginError::Config(
                    "settings.limiter.burst must not be negative".into(),
                ));
            }
        }
        if self.settings.transaction.ttl_secs == 0 {
            return Err(PluginError::Config(
                "settings.transaction.ttl_secs must be greater than zero".into(),
            ));
        }
        if self.settings.cache.enabled && self.settings.cache.size == 0 {
            return Err(PluginError::Config(
                "settings.cache.size must be greater than zero".into(),
            ));
        }
        if self.network.address.is_empty() {
            return Err(PluginError::Config(
                "network.address must not be empty".into(),
            ));
        }
        Ok(())
    }
}
