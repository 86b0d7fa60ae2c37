//! Versioned rule registry
//!
//! Rules are published as whole immutable snapshots. An evaluation reads
//! the current `Arc<RuleSnapshot>` once and keeps it to completion, so a
//! concurrent publish never changes an outcome already in progress.

use crate::{Decision, Error, Result, RuleCategory};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Category-specific trigger condition and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Count or volume inside a rolling window, current transaction included
    Velocity {
        /// Window length in seconds
        window_secs: u64,
        /// Trigger when the count exceeds this
        #[serde(default)]
        max_count: Option<u32>,
        /// Trigger when the total exceeds this
        #[serde(default)]
        max_amount: Option<Decimal>,
    },

    /// Amount far above the user's historical average
    AmountDeviation {
        /// History considered for the average
        lookback_days: u32,
        /// Trigger when amount > average * multiplier
        multiplier: Decimal,
        /// Minimum counted transactions before the average is trusted
        min_history: u32,
    },

    /// Amount above a fixed threshold or a fraction of the user's single-transaction limit
    LargeAmount {
        /// Fixed threshold
        #[serde(default)]
        threshold: Option<Decimal>,
        /// Fraction of `max_single_transaction`
        #[serde(default)]
        fraction_of_limit: Option<Decimal>,
    },

    /// Country never seen, or first seen recently, against an established history
    NewCountry {
        /// How long a country stays "new" after its first sighting
        novelty_hours: u32,
    },

    /// Country on the rule's list
    CountryList {
        /// ISO alpha-2 codes
        countries: Vec<String>,
    },

    /// Country outside the user's allow list
    CountryNotAllowed,

    /// Device new to the user, or known but not yet trusted
    UntrustedDevice {
        /// Severity for a known untrusted device; a first sighting is always 1.0
        known_untrusted_severity: f64,
    },

    /// Outside the user's allowed local time window
    OutsideAllowedHours,

    /// Behavioral profile deviation above a floor
    ProfileDeviation {
        /// Trigger when deviation >= this (0-1)
        min_deviation: f64,
    },

    /// Counterparty absent from the behavioral profile
    NewCounterparty,
}

impl RuleCondition {
    /// Category this condition belongs to
    pub fn category(&self) -> RuleCategory {
        match self {
            RuleCondition::Velocity { .. } => RuleCategory::Velocity,
            RuleCondition::AmountDeviation { .. } | RuleCondition::LargeAmount { .. } => {
                RuleCategory::Amount
            }
            RuleCondition::NewCountry { .. }
            | RuleCondition::CountryList { .. }
            | RuleCondition::CountryNotAllowed => RuleCategory::Geography,
            RuleCondition::UntrustedDevice { .. } => RuleCategory::Device,
            RuleCondition::OutsideAllowedHours => RuleCategory::Time,
            RuleCondition::ProfileDeviation { .. } | RuleCondition::NewCounterparty => {
                RuleCategory::Behavior
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            RuleCondition::Velocity {
                window_secs,
                max_count,
                max_amount,
            } => {
                if *window_secs == 0 {
                    return Err("velocity window must be positive".to_string());
                }
                if max_count.is_none() && max_amount.is_none() {
                    return Err("velocity rule needs max_count or max_amount".to_string());
                }
                if *max_count == Some(0) || max_amount.map_or(false, |a| a <= Decimal::ZERO) {
                    return Err("velocity limits must be positive".to_string());
                }
            }
            RuleCondition::AmountDeviation {
                lookback_days,
                multiplier,
                min_history,
            } => {
                if *lookback_days == 0 || *min_history == 0 {
                    return Err("lookback and min_history must be positive".to_string());
                }
                if *multiplier <= Decimal::ONE {
                    return Err(format!("multiplier {} must exceed 1", multiplier));
                }
            }
            RuleCondition::LargeAmount {
                threshold,
                fraction_of_limit,
            } => {
                if threshold.is_none() && fraction_of_limit.is_none() {
                    return Err("large amount rule needs threshold or fraction_of_limit".to_string());
                }
                if threshold.map_or(false, |t| t <= Decimal::ZERO) {
                    return Err("threshold must be positive".to_string());
                }
                if fraction_of_limit.map_or(false, |f| f <= Decimal::ZERO || f > Decimal::ONE) {
                    return Err("fraction_of_limit must be in (0, 1]".to_string());
                }
            }
            RuleCondition::NewCountry { novelty_hours } => {
                if *novelty_hours == 0 {
                    return Err("novelty window must be positive".to_string());
                }
            }
            RuleCondition::CountryList { countries } => {
                if countries.is_empty() {
                    return Err("country list is empty".to_string());
                }
                if let Some(bad) = countries
                    .iter()
                    .find(|c| c.len() != 2 || !c.chars().all(|ch| ch.is_ascii_uppercase()))
                {
                    return Err(format!("invalid country code '{}'", bad));
                }
            }
            RuleCondition::UntrustedDevice {
                known_untrusted_severity,
            } => {
                if !(0.0..=1.0).contains(known_untrusted_severity) {
                    return Err("known_untrusted_severity must be in [0, 1]".to_string());
                }
            }
            RuleCondition::ProfileDeviation { min_deviation } => {
                if !(0.0..=1.0).contains(min_deviation) {
                    return Err("min_deviation must be in [0, 1]".to_string());
                }
            }
            RuleCondition::CountryNotAllowed
            | RuleCondition::OutsideAllowedHours
            | RuleCondition::NewCounterparty => {}
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// Published rule definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Unique rule ID
    pub id: String,

    /// Short description used in factor text
    pub name: String,

    /// Trigger condition
    pub condition: RuleCondition,

    /// Score weight (0-100)
    pub weight: u8,

    /// Decision forced whenever this rule triggers
    #[serde(default)]
    pub forces_decision: Option<Decision>,

    /// Open an alert whenever this rule triggers
    #[serde(default)]
    pub alert_on_trigger: bool,

    /// Disabled rules are kept for audit but not evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rule definition version
    #[serde(default = "default_version")]
    pub version: u32,
}

impl ValidationRule {
    /// Create an enabled rule with no override
    pub fn new(id: impl Into<String>, name: impl Into<String>, condition: RuleCondition, weight: u8) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            weight,
            forces_decision: None,
            alert_on_trigger: false,
            enabled: true,
            version: 1,
        }
    }

    /// Force a decision whenever the rule triggers
    pub fn forcing(mut self, decision: Decision) -> Self {
        self.forces_decision = Some(decision);
        self
    }

    /// Open an alert whenever the rule triggers
    pub fn alerting(mut self) -> Self {
        self.alert_on_trigger = true;
        self
    }

    /// Mark the rule disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Category of the rule's condition
    pub fn category(&self) -> RuleCategory {
        self.condition.category()
    }

    /// Check definition before publication
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRule("rule id is empty".to_string()));
        }
        if self.weight > 100 {
            return Err(Error::InvalidRule(format!(
                "rule {} weight {} exceeds 100",
                self.id, self.weight
            )));
        }
        self.condition
            .validate()
            .map_err(|msg| Error::InvalidRule(format!("rule {}: {}", self.id, msg)))
    }
}

/// Immutable ordered rule set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    /// Registry version, incremented per publish
    pub version: u64,

    /// Rules in evaluation order, disabled ones included
    pub rules: Vec<ValidationRule>,

    /// Publication time
    pub published_at: DateTime<Utc>,
}

impl RuleSnapshot {
    /// Rules that take part in evaluation, in registry order
    pub fn enabled(&self) -> impl Iterator<Item = &ValidationRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Look up a rule by ID
    pub fn get(&self, rule_id: &str) -> Option<&ValidationRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }
}

#[derive(Debug, Deserialize)]
struct RuleSetFile {
    #[serde(default)]
    rules: Vec<ValidationRule>,
}

/// Holder of the current snapshot
#[derive(Debug, Default)]
pub struct RuleRegistry {
    current: RwLock<Option<Arc<RuleSnapshot>>>,
}

impl RuleRegistry {
    /// Create a registry with nothing published yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry and publish `rules` as version 1
    pub fn with_rules(rules: Vec<ValidationRule>) -> Result<Self> {
        let registry = Self::new();
        registry.publish(rules)?;
        Ok(registry)
    }

    /// `currentRules()`: the snapshot to use for one evaluation
    pub fn current_rules(&self) -> Result<Arc<RuleSnapshot>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| Error::RegistryUnavailable("no rule set published".to_string()))
    }

    /// Version of the current snapshot, 0 when nothing is published
    pub fn version(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |s| s.version)
    }

    /// Validate and atomically replace the snapshot, returning the new version
    pub fn publish(&self, rules: Vec<ValidationRule>) -> Result<u64> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::InvalidRule(format!("duplicate rule id {}", rule.id)));
            }
        }

        let mut current = self.current.write();
        let version = current.as_ref().map_or(0, |s| s.version) + 1;
        let enabled = rules.iter().filter(|r| r.enabled).count();
        let total = rules.len();

        *current = Some(Arc::new(RuleSnapshot {
            version,
            rules,
            published_at: Utc::now(),
        }));

        info!(
            "Published rule set v{} ({} rules, {} enabled)",
            version, total, enabled
        );
        Ok(version)
    }

    /// Parse a TOML rule set (`[[rules]]` tables) and publish it
    pub fn publish_toml(&self, content: &str) -> Result<u64> {
        let file: RuleSetFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse rule set: {}", e)))?;
        self.publish(file.rules)
    }

    /// Load and publish a TOML rule set file; the old snapshot stays on failure
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        self.publish_toml(&content).map_err(|e| {
            warn!("Rejected rule set from {:?}: {}", path, e);
            e
        })
    }
}

/// Built-in rule set covering every category
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::new(
            "velocity-burst",
            "Burst of transactions",
            RuleCondition::Velocity {
                window_secs: 300,
                max_count: Some(5),
                max_amount: None,
            },
            35,
        ),
        ValidationRule::new(
            "velocity-daily-volume",
            "High daily volume",
            RuleCondition::Velocity {
                window_secs: 86_400,
                max_count: Some(100),
                max_amount: Some(Decimal::from(25_000)),
            },
            20,
        ),
        ValidationRule::new(
            "amount-deviation",
            "Amount far above usual spend",
            RuleCondition::AmountDeviation {
                lookback_days: 30,
                multiplier: Decimal::from(3),
                min_history: 3,
            },
            25,
        ),
        ValidationRule::new(
            "amount-near-limit",
            "Amount close to single-transaction limit",
            RuleCondition::LargeAmount {
                threshold: None,
                fraction_of_limit: Some(Decimal::new(8, 1)),
            },
            15,
        ),
        ValidationRule::new(
            "amount-large",
            "Large transaction",
            RuleCondition::LargeAmount {
                threshold: Some(Decimal::from(10_000)),
                fraction_of_limit: None,
            },
            20,
        ),
        ValidationRule::new(
            "geo-new-country",
            "Transaction from a new country",
            RuleCondition::NewCountry { novelty_hours: 24 },
            30,
        ),
        ValidationRule::new(
            "geo-sanctioned",
            "Sanctioned jurisdiction",
            RuleCondition::CountryList {
                countries: vec![
                    "KP".to_string(),
                    "IR".to_string(),
                    "SY".to_string(),
                    "CU".to_string(),
                ],
            },
            50,
        )
        .forcing(Decision::Block)
        .alerting(),
        ValidationRule::new(
            "geo-not-allowed",
            "Country outside allowed list",
            RuleCondition::CountryNotAllowed,
            25,
        ),
        ValidationRule::new(
            "device-untrusted",
            "Unrecognized or untrusted device",
            RuleCondition::UntrustedDevice {
                known_untrusted_severity: 0.5,
            },
            15,
        ),
        ValidationRule::new(
            "time-outside-window",
            "Outside allowed hours",
            RuleCondition::OutsideAllowedHours,
            20,
        ),
        ValidationRule::new(
            "behavior-profile-deviation",
            "Deviates from behavioral profile",
            RuleCondition::ProfileDeviation { min_deviation: 0.6 },
            25,
        ),
        ValidationRule::new(
            "behavior-new-counterparty",
            "First payment to counterparty",
            RuleCondition::NewCounterparty,
            10,
        ),
    ]
}
