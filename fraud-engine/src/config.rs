//! Configuration for the fraud engine

use crate::devices::DeviceTrustPolicy;
use crate::settings::RiskThresholds;
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Fallback thresholds for users with invalid or missing settings
    pub thresholds: RiskThresholds,

    /// Device trust lifecycle
    pub device_trust: DeviceTrustConfig,

    /// Aggregate history
    pub aggregates: AggregatesConfig,

    /// Alert notifications
    pub notifications: NotificationConfig,

    /// Async worker
    pub worker: WorkerConfig,

    /// Rule set file; built-in rules when unset
    pub rules_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "fraud-engine".to_string(),
            thresholds: RiskThresholds::default(),
            device_trust: DeviceTrustConfig::default(),
            aggregates: AggregatesConfig::default(),
            notifications: NotificationConfig::default(),
            worker: WorkerConfig::default(),
            rules_path: None,
        }
    }
}

/// Device trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceTrustConfig {
    /// Consecutive clean transactions before a device is trusted
    pub promotion_threshold: u32,

    /// Inactivity after which trust is revoked (days)
    pub decay_days: u32,
}

impl Default for DeviceTrustConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 5,
            decay_days: 90,
        }
    }
}

impl DeviceTrustConfig {
    /// As tracker policy
    pub fn policy(&self) -> DeviceTrustPolicy {
        DeviceTrustPolicy {
            promotion_threshold: self.promotion_threshold,
            decay_after: Duration::days(self.decay_days as i64),
        }
    }
}

/// Aggregate history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatesConfig {
    /// How long log entries are kept (days)
    pub retention_days: u32,

    /// How much history each evaluation loads (days)
    pub lookback_days: u32,
}

impl Default for AggregatesConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            lookback_days: 30,
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Bounded queue size; overflow is dropped
    pub channel_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Request queue size of the async handle
    pub queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_size: 1000 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(path) = std::env::var("FRAUD_ENGINE_RULES_PATH") {
            config.rules_path = Some(PathBuf::from(path));
        }

        if let Some(value) = env_number("FRAUD_ENGINE_PROMOTION_THRESHOLD")? {
            config.device_trust.promotion_threshold = value;
        }

        if let Some(value) = env_number("FRAUD_ENGINE_TRUST_DECAY_DAYS")? {
            config.device_trust.decay_days = value;
        }

        if let Some(value) = env_number("FRAUD_ENGINE_RETENTION_DAYS")? {
            config.aggregates.retention_days = value;
        }

        if let Some(value) = env_number("FRAUD_ENGINE_LOOKBACK_DAYS")? {
            config.aggregates.lookback_days = value;
        }

        if let Some(value) = env_number("FRAUD_ENGINE_NOTIFICATION_CAPACITY")? {
            config.notifications.channel_capacity = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.thresholds
            .validate()
            .map_err(|e| Error::Config(format!("default thresholds: {}", e)))?;
        self.device_trust.policy().validate()?;

        if self.aggregates.lookback_days == 0 {
            return Err(Error::Config("aggregates.lookback_days must be positive".to_string()));
        }
        if self.aggregates.retention_days < self.aggregates.lookback_days {
            return Err(Error::Config(format!(
                "aggregates.retention_days ({}) shorter than lookback_days ({})",
                self.aggregates.retention_days, self.aggregates.lookback_days
            )));
        }
        if self.worker.queue_size == 0 {
            return Err(Error::Config("worker.queue_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Log retention as a duration
    pub fn retention(&self) -> Duration {
        Duration::days(self.aggregates.retention_days as i64)
    }

    /// Lookback as a duration
    pub fn lookback(&self) -> Duration {
        Duration::days(self.aggregates.lookback_days as i64)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} is not a valid number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
