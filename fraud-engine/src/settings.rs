//! Per-user transaction security settings
//!
//! Settings are replaced wholesale: a write either passes validation and
//! swaps the whole object, or is rejected.

use crate::{Error, Result, RiskLevel};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Score cut points, non-decreasing: review <= require_2fa <= auto_block <= 100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    /// Scores at or above this go to manual review
    pub review: u8,

    /// Scores at or above this require step-up authentication
    pub require_2fa: u8,

    /// Scores at or above this are blocked
    pub auto_block: u8,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            review: 30,
            require_2fa: 60,
            auto_block: 85,
        }
    }
}

impl RiskThresholds {
    /// Check the monotonic-threshold invariant
    pub fn validate(&self) -> Result<()> {
        if self.auto_block > 100 {
            return Err(Error::InvalidSettings(format!(
                "auto_block threshold {} exceeds 100",
                self.auto_block
            )));
        }
        if !(self.review <= self.require_2fa && self.require_2fa <= self.auto_block) {
            return Err(Error::InvalidSettings(format!(
                "thresholds must be non-decreasing: review={} require_2fa={} auto_block={}",
                self.review, self.require_2fa, self.auto_block
            )));
        }
        Ok(())
    }
}

/// Window of local time in which transactions are expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRestriction {
    /// First allowed hour (local, 0-23)
    pub start_hour: u8,

    /// First disallowed hour (local, 1-24); may be below `start_hour` to wrap midnight
    pub end_hour: u8,

    /// Offset of the user's local time from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Allowed weekdays; empty means every day
    #[serde(default)]
    pub allowed_days: Vec<Weekday>,
}

impl TimeRestriction {
    fn validate(&self) -> Result<()> {
        if self.start_hour > 23 || self.end_hour > 24 || self.start_hour == self.end_hour {
            return Err(Error::InvalidSettings(format!(
                "invalid time window {}..{}",
                self.start_hour, self.end_hour
            )));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(Error::InvalidSettings(format!(
                "utc offset {} minutes out of range",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    /// Whether `at` falls inside the allowed window
    pub fn allows(&self, at: DateTime<Utc>) -> bool {
        let local = at + Duration::minutes(self.utc_offset_minutes as i64);
        if !self.allowed_days.is_empty() && !self.allowed_days.contains(&local.weekday()) {
            return false;
        }

        let hour = local.hour() as u8;
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Which channels the user wants alerts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    /// Deliver by email
    pub email: bool,

    /// Deliver by SMS
    pub sms: bool,

    /// Deliver by push notification
    pub push: bool,

    /// Alerts below this severity are not dispatched
    pub min_severity: RiskLevel,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email: true,
            sms: false,
            push: true,
            min_severity: RiskLevel::High,
        }
    }
}

impl NotificationPreferences {
    /// Whether an alert of `severity` should be dispatched at all
    pub fn wants(&self, severity: RiskLevel) -> bool {
        (self.email || self.sms || self.push) && severity >= self.min_severity
    }
}

/// Per-user limits and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSecuritySettings {
    /// Score thresholds
    #[serde(default)]
    pub thresholds: RiskThresholds,

    /// Single transaction ceiling
    #[serde(default)]
    pub max_single_transaction: Option<Decimal>,

    /// Rolling 24h ceiling
    #[serde(default)]
    pub max_daily_amount: Option<Decimal>,

    /// Countries the user transacts from; empty means no restriction
    #[serde(default)]
    pub allowed_countries: Vec<String>,

    /// Countries that always block
    #[serde(default)]
    pub blocked_countries: Vec<String>,

    /// Allowed local time window
    #[serde(default)]
    pub time_restrictions: Option<TimeRestriction>,

    /// Alert delivery preferences
    #[serde(default)]
    pub notifications: NotificationPreferences,
}

impl Default for TransactionSecuritySettings {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            max_single_transaction: None,
            max_daily_amount: None,
            allowed_countries: Vec::new(),
            blocked_countries: Vec::new(),
            time_restrictions: None,
            notifications: NotificationPreferences::default(),
        }
    }
}

impl TransactionSecuritySettings {
    /// Validate before a write is accepted
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;

        for (name, limit) in [
            ("max_single_transaction", self.max_single_transaction),
            ("max_daily_amount", self.max_daily_amount),
        ] {
            if let Some(limit) = limit {
                if limit <= Decimal::ZERO {
                    return Err(Error::InvalidSettings(format!(
                        "{} must be positive, got {}",
                        name, limit
                    )));
                }
            }
        }

        for country in self.allowed_countries.iter().chain(&self.blocked_countries) {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(Error::InvalidSettings(format!(
                    "invalid country code '{}'",
                    country
                )));
            }
        }

        if let Some(country) = self
            .blocked_countries
            .iter()
            .find(|c| self.allowed_countries.contains(c))
        {
            return Err(Error::InvalidSettings(format!(
                "country {} is both allowed and blocked",
                country
            )));
        }

        if let Some(restriction) = &self.time_restrictions {
            restriction.validate()?;
        }

        Ok(())
    }

    /// Whether the country is on the user's block list
    pub fn is_blocked_country(&self, country: &str) -> bool {
        self.blocked_countries.iter().any(|c| c == country)
    }

    /// Whether the country passes the allow list (an empty list allows all)
    pub fn is_allowed_country(&self, country: &str) -> bool {
        self.allowed_countries.is_empty() || self.allowed_countries.iter().any(|c| c == country)
    }
}

/// Storage for the single active settings object per user
pub trait SettingsStore: Send + Sync {
    /// Fetch the active settings, if any were written
    fn get(&self, user_id: &str) -> Result<Option<TransactionSecuritySettings>>;

    /// Replace the active settings
    fn put(&self, user_id: &str, settings: TransactionSecuritySettings) -> Result<()>;
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    settings: DashMap<String, TransactionSecuritySettings>,
}

impl InMemorySettingsStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn get(&self, user_id: &str) -> Result<Option<TransactionSecuritySettings>> {
        Ok(self.settings.get(user_id).map(|s| s.value().clone()))
    }

    fn put(&self, user_id: &str, settings: TransactionSecuritySettings) -> Result<()> {
        self.settings.insert(user_id.to_string(), settings);
        Ok(())
    }
}
