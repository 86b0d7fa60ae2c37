//! Core types for the fraud engine

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum clock skew tolerated between a transaction timestamp and the engine clock
pub const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Risk score (0-100)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    /// Highest representable score
    pub const MAX: Score = Score(100);

    /// Create new score, saturating at 100
    pub fn new(score: u8) -> Self {
        Self(score.min(100))
    }

    /// Clamp an arbitrary signed sum of contributions into [0, 100]
    pub fn clamped(sum: i64) -> Self {
        Self(sum.clamp(0, 100) as u8)
    }

    /// Get raw score
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Below the review threshold
    Low,
    /// Between review and step-up thresholds
    Medium,
    /// Between step-up and auto-block thresholds
    High,
    /// At or above the auto-block threshold
    Critical,
}

impl RiskLevel {
    /// Whether this level opens an alert on its own
    pub fn is_actionable(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }

    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Outcome returned to the payment pipeline
///
/// Variants are ordered by severity so `max` picks the most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the transaction through
    Allow,
    /// Hold for manual review
    Review,
    /// Require step-up authentication
    #[serde(rename = "require_2fa")]
    Require2fa,
    /// Reject the transaction
    Block,
}

impl Decision {
    /// Clean outcomes count towards device trust promotion
    pub fn is_clean(&self) -> bool {
        matches!(self, Decision::Allow | Decision::Require2fa)
    }

    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Review => "review",
            Decision::Require2fa => "require_2fa",
            Decision::Block => "block",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel a transaction was initiated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Browser session
    Web,
    /// Mobile application
    Mobile,
    /// Programmatic API client
    Api,
    /// Physical card terminal
    CardPresent,
    /// In-branch teller
    Branch,
}

/// Transaction submitted for evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: Uuid,

    /// Amount (exact decimal, always positive)
    pub amount: Decimal,

    /// ISO 4217 currency code
    pub currency: String,

    /// Opaque counterparty identifier
    pub counterparty_id: String,

    /// Initiation time (UTC)
    pub timestamp: DateTime<Utc>,

    /// Opaque device identifier
    pub device_id: String,

    /// ISO 3166 alpha-2 country the transaction originates from
    pub origin_country: String,

    /// Initiation channel
    pub channel: Channel,
}

impl Transaction {
    /// Reject malformed transactions before any scoring happens
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(Error::InvalidInput(format!(
                "Transaction {} has non-positive amount {}",
                self.id, self.amount
            )));
        }

        if !is_upper_alpha(&self.currency, 3) {
            return Err(Error::InvalidInput(format!(
                "Transaction {} has invalid currency code '{}'",
                self.id, self.currency
            )));
        }

        if !is_upper_alpha(&self.origin_country, 2) {
            return Err(Error::InvalidInput(format!(
                "Transaction {} has invalid country code '{}'",
                self.id, self.origin_country
            )));
        }

        if self.counterparty_id.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "Transaction {} is missing a counterparty",
                self.id
            )));
        }

        if self.device_id.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "Transaction {} is missing a device id",
                self.id
            )));
        }

        if self.timestamp > now + Duration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(Error::InvalidInput(format!(
                "Transaction {} is timestamped in the future ({})",
                self.id, self.timestamp
            )));
        }

        Ok(())
    }
}

fn is_upper_alpha(code: &str, len: usize) -> bool {
    code.len() == len && code.chars().all(|c| c.is_ascii_uppercase())
}

/// Rule category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// Transaction frequency and volume in a window
    Velocity,
    /// Single-transaction size
    Amount,
    /// Origin country
    Geography,
    /// Device recognition and trust
    Device,
    /// Time-of-day restrictions
    Time,
    /// Deviation from the behavioral profile
    Behavior,
}

impl RuleCategory {
    /// Categories that read the aggregate log
    pub fn needs_aggregates(&self) -> bool {
        matches!(self, RuleCategory::Velocity | RuleCategory::Amount)
    }
}

/// One triggered rule's contribution to the score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    /// Rule that produced this factor
    pub rule_id: String,

    /// Rule category
    pub category: RuleCategory,

    /// Signed score delta
    pub contribution: i32,

    /// Human-readable description
    pub description: String,
}

/// Where a forced decision came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OverrideSource {
    /// A triggered rule carrying `forces_decision`
    Rule {
        /// Rule ID
        rule_id: String,
    },
    /// Origin country on the user's block list
    BlockedCountry {
        /// Country code
        country: String,
    },
    /// Amount above the single-transaction ceiling
    SingleTransactionLimit,
    /// Rolling daily total above the ceiling
    DailyLimit,
}

/// Decision forced irrespective of the numeric score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOverride {
    /// Origin of the override
    pub source: OverrideSource,

    /// Forced decision
    pub decision: Decision,

    /// Human-readable reason
    pub reason: String,
}

/// Risk evaluation result for a single attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Evaluated transaction
    pub transaction_id: Uuid,

    /// Owner of the transaction
    pub user_id: String,

    /// Bounded score
    pub score: Score,

    /// Level derived from score and thresholds
    pub level: RiskLevel,

    /// Triggered rules in registry order
    pub factors: Vec<RiskFactor>,

    /// Final decision
    pub decision: Decision,

    /// Overrides that applied, in the order they were found
    pub overrides: Vec<DecisionOverride>,

    /// Computed with one or more dependencies unavailable
    pub degraded: bool,

    /// Rule snapshot the evaluation ran against (0 when none was readable)
    pub rule_set_version: u64,

    /// Evaluation timestamp
    pub computed_at: DateTime<Utc>,
}

impl RiskScore {
    /// Sum of the raw factor contributions before clamping
    pub fn raw_total(&self) -> i64 {
        self.factors.iter().map(|f| f.contribution as i64).sum()
    }

    /// Whether any factor came from the given category
    pub fn has_category(&self, category: RuleCategory) -> bool {
        self.factors.iter().any(|f| f.category == category)
    }
}
