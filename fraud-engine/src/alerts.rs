//! Security alerts and the security event log
//!
//! Alerts move `open -> resolved` and never back. Events are append-only.

use crate::{Error, Result, RiskLevel, RiskScore, Score};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Why an alert was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Level reached high or critical
    HighRiskScore,
    /// A rule flagged `alert_on_trigger` fired below the high level
    RuleTriggered,
}

/// Alert raised by an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    /// Alert ID
    pub id: Uuid,

    /// Affected user
    pub user_id: String,

    /// Transaction that raised it
    pub transaction_id: Uuid,

    /// Reason
    pub alert_type: AlertType,

    /// Level of the evaluation
    pub severity: RiskLevel,

    /// Score of the evaluation
    pub score: Score,

    /// Triggered rules
    pub rule_ids: Vec<String>,

    /// Summary line
    pub message: String,

    /// Terminal once set
    pub resolved: bool,

    /// Resolution note
    pub resolution: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Kinds of entries in the security event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// Every evaluation
    TransactionEvaluated,
    /// Alert opened
    AlertCreated,
    /// Alert resolved
    AlertResolved,
    /// First sighting of a device
    DeviceRegistered,
    /// Device promoted to trusted
    DeviceTrusted,
    /// Trust expired after inactivity
    DeviceTrustDecayed,
    /// Trust revoked by the user
    DeviceRevoked,
    /// User thresholds rejected, defaults applied
    ConfigurationFault,
    /// Evaluation ran without a dependency
    DegradedEvaluation,
    /// Settings replaced
    SettingsUpdated,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Time-ordered event ID
    pub id: Uuid,

    /// Affected user
    pub user_id: String,

    /// Event kind
    pub event_type: SecurityEventType,

    /// Related transaction
    pub transaction_id: Option<Uuid>,

    /// Related alert
    pub alert_id: Option<Uuid>,

    /// Event-specific payload
    pub details: Value,

    /// When it happened
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// New event stamped `at`
    pub fn new(user_id: &str, event_type: SecurityEventType, details: Value, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            event_type,
            transaction_id: None,
            alert_id: None,
            details,
            timestamp: at,
        }
    }

    /// Attach transaction
    pub fn with_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    /// Attach alert
    pub fn with_alert(mut self, alert_id: Uuid) -> Self {
        self.alert_id = Some(alert_id);
        self
    }
}

/// Outcome of a compare-and-set resolution
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// This call flipped the flag
    Resolved(SecurityAlert),
    /// Another call got there first
    AlreadyResolved(SecurityAlert),
}

/// Alert persistence
pub trait AlertStore: Send + Sync {
    /// Insert or replace an alert
    fn upsert(&self, alert: SecurityAlert) -> Result<()>;

    /// Fetch one alert
    fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>>;

    /// Flip `resolved` if still open; `Ok(None)` when the ID is unknown
    fn resolve(&self, alert_id: Uuid, resolution: &str, at: DateTime<Utc>) -> Result<Option<ResolveOutcome>>;

    /// Alerts still open, oldest first
    fn open(&self) -> Result<Vec<SecurityAlert>>;

    /// Every alert of the user, oldest first
    fn for_user(&self, user_id: &str) -> Result<Vec<SecurityAlert>>;
}

/// Security event log
pub trait EventSink: Send + Sync {
    /// Append one event
    fn append(&self, event: SecurityEvent) -> Result<()>;

    /// Events of the user in append order
    fn for_user(&self, user_id: &str) -> Result<Vec<SecurityEvent>>;
}

/// In-memory alert store
#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    alerts: DashMap<Uuid, SecurityAlert>,
}

impl InMemoryAlertStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, filter: impl Fn(&SecurityAlert) -> bool) -> Vec<SecurityAlert> {
        let mut alerts: Vec<_> = self
            .alerts
            .iter()
            .filter(|a| filter(a.value()))
            .map(|a| a.value().clone())
            .collect();
        alerts.sort_by_key(|a| (a.created_at, a.id));
        alerts
    }
}

impl AlertStore for InMemoryAlertStore {
    fn upsert(&self, alert: SecurityAlert) -> Result<()> {
        self.alerts.insert(alert.id, alert);
        Ok(())
    }

    fn get(&self, alert_id: Uuid) -> Result<Option<SecurityAlert>> {
        Ok(self.alerts.get(&alert_id).map(|a| a.value().clone()))
    }

    fn resolve(&self, alert_id: Uuid, resolution: &str, at: DateTime<Utc>) -> Result<Option<ResolveOutcome>> {
        // The shard write lock makes check-and-flip atomic
        let Some(mut alert) = self.alerts.get_mut(&alert_id) else {
            return Ok(None);
        };
        if alert.resolved {
            return Ok(Some(ResolveOutcome::AlreadyResolved(alert.clone())));
        }
        alert.resolved = true;
        alert.resolution = Some(resolution.to_string());
        alert.resolved_at = Some(at);
        Ok(Some(ResolveOutcome::Resolved(alert.clone())))
    }

    fn open(&self) -> Result<Vec<SecurityAlert>> {
        Ok(self.collect(|a| !a.resolved))
    }

    fn for_user(&self, user_id: &str) -> Result<Vec<SecurityAlert>> {
        Ok(self.collect(|a| a.user_id == user_id))
    }
}

/// In-memory event log
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemoryEventLog {
    /// Create empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether no event was appended yet
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSink for InMemoryEventLog {
    fn append(&self, event: SecurityEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    fn for_user(&self, user_id: &str) -> Result<Vec<SecurityEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Alert creation and resolution
pub struct AlertManager {
    alerts: Arc<dyn AlertStore>,
    events: Arc<dyn EventSink>,
}

impl AlertManager {
    /// Create manager over the given stores
    pub fn new(alerts: Arc<dyn AlertStore>, events: Arc<dyn EventSink>) -> Self {
        Self { alerts, events }
    }

    /// Alert an evaluation should open, if any
    pub fn alert_for(score: &RiskScore, alerting_rules: &[String]) -> Option<SecurityAlert> {
        let alert_type = if score.level.is_actionable() {
            AlertType::HighRiskScore
        } else if !alerting_rules.is_empty() {
            AlertType::RuleTriggered
        } else {
            return None;
        };

        let message = match alert_type {
            AlertType::HighRiskScore => format!(
                "Transaction scored {} ({}), decision {}",
                score.score,
                score.level.as_str(),
                score.decision
            ),
            AlertType::RuleTriggered => format!(
                "Rule(s) {} triggered, decision {}",
                alerting_rules.join(", "),
                score.decision
            ),
        };

        Some(SecurityAlert {
            id: Uuid::new_v4(),
            user_id: score.user_id.clone(),
            transaction_id: score.transaction_id,
            alert_type,
            severity: score.level,
            score: score.score,
            rule_ids: score.factors.iter().map(|f| f.rule_id.clone()).collect(),
            message,
            resolved: false,
            resolution: None,
            created_at: score.computed_at,
            resolved_at: None,
        })
    }

    /// Resolve an open alert, reporting whether this call flipped it
    ///
    /// Unknown IDs fail with `NotFound`. Only the flipping call appends an
    /// `alert_resolved` event.
    pub fn resolve(&self, alert_id: Uuid, resolution: &str, at: DateTime<Utc>) -> Result<ResolveOutcome> {
        let outcome = self
            .alerts
            .resolve(alert_id, resolution, at)?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))?;

        match &outcome {
            ResolveOutcome::AlreadyResolved(_) => debug!("Alert {} already resolved", alert_id),
            ResolveOutcome::Resolved(alert) => {
                info!("Alert {} resolved for user {}", alert.id, alert.user_id);
                let event = SecurityEvent::new(
                    &alert.user_id,
                    SecurityEventType::AlertResolved,
                    serde_json::json!({ "resolution": resolution }),
                    at,
                )
                .with_transaction(alert.transaction_id)
                .with_alert(alert.id);
                self.events.append(event)?;
            }
        }
        Ok(outcome)
    }

    /// `resolveAlert(alertId, resolution)`; resolving twice returns the stored record unchanged
    pub fn resolve_alert(&self, alert_id: Uuid, resolution: &str, at: DateTime<Utc>) -> Result<SecurityAlert> {
        Ok(match self.resolve(alert_id, resolution, at)? {
            ResolveOutcome::Resolved(alert) | ResolveOutcome::AlreadyResolved(alert) => alert,
        })
    }

    /// Fetch one alert
    pub fn get(&self, alert_id: Uuid) -> Result<SecurityAlert> {
        self.alerts
            .get(alert_id)?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))
    }

    /// All open alerts
    pub fn open_alerts(&self) -> Result<Vec<SecurityAlert>> {
        self.alerts.open()
    }

    /// All alerts of a user
    pub fn alerts_for_user(&self, user_id: &str) -> Result<Vec<SecurityAlert>> {
        self.alerts.for_user(user_id)
    }

    /// Security events of a user
    pub fn events_for_user(&self, user_id: &str) -> Result<Vec<SecurityEvent>> {
        self.events.for_user(user_id)
    }
}
