//! Fraud engine facade
//!
//! One evaluation runs under the user's lock:
//!
//! ```text
//!   settings ─┐
//!   history ──┼─> RiskEvaluator ─> LimitChecker ─> DecisionPolicy ─> RiskScore
//!   device ───┤                                                        │
//!   profile ──┘                                                        v
//!                                            effects (log, device, alert, events, notify)
//! ```
//!
//! The decision is computed first as plain data. Side effects are then
//! described as [`Effect`] values, applied best-effort through the injected
//! stores, and returned to the caller.

use crate::alerts::{
    AlertManager, AlertStore, EventSink, InMemoryAlertStore, InMemoryEventLog, ResolveOutcome, SecurityAlert,
    SecurityEvent, SecurityEventType,
};
use crate::config::Config;
use crate::devices::{DeviceFingerprint, DeviceStore, DeviceTrustTracker, InMemoryDeviceStore, TrustChange};
use crate::limits::LimitChecker;
use crate::metrics::Metrics;
use crate::notify::{AlertNotification, NoopNotifier, Notifier};
use crate::policy::DecisionPolicy;
use crate::rules::{default_rules, RuleRegistry, RuleSnapshot};
use crate::scoring::{EvaluationContext, ProfileSource, RiskEvaluator, RuleEvaluation, StaticProfiles};
use crate::settings::{InMemorySettingsStore, SettingsStore, TransactionSecuritySettings};
use crate::velocity::{AggregateAccessor, InMemoryTransactionLog, TransactionEvent, TransactionLog, UserLocks};
use crate::{Error, Result, RiskScore, Score, Transaction};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Side effect of an evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append to the user's transaction log
    AppendTransactionEvent {
        /// Owner
        user_id: String,
        /// Log entry
        event: TransactionEvent,
    },
    /// Append to the security event log
    AppendSecurityEvent(SecurityEvent),
    /// Persist the device record
    UpsertDevice(DeviceFingerprint),
    /// Persist a new alert
    UpsertAlert(SecurityAlert),
    /// Dispatch an alert notification
    NotifyAlert(AlertNotification),
}

/// Result of one evaluation
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Score and decision
    pub risk_score: RiskScore,

    /// Alert opened by this evaluation
    pub alert: Option<SecurityAlert>,

    /// Device record after the outcome was folded in
    pub device: Option<DeviceFingerprint>,

    /// Effects in the order they were applied
    pub effects: Vec<Effect>,
}

impl Evaluation {
    /// Security events produced by the evaluation
    pub fn security_events(&self) -> impl Iterator<Item = &SecurityEvent> {
        self.effects.iter().filter_map(|e| match e {
            Effect::AppendSecurityEvent(event) => Some(event),
            _ => None,
        })
    }
}

/// Builder for [`FraudEngine`]; every collaborator defaults to in-memory
pub struct FraudEngineBuilder {
    config: Config,
    registry: Option<Arc<RuleRegistry>>,
    settings: Option<Arc<dyn SettingsStore>>,
    transactions: Option<Arc<dyn TransactionLog>>,
    devices: Option<Arc<dyn DeviceStore>>,
    alerts: Option<Arc<dyn AlertStore>>,
    events: Option<Arc<dyn EventSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    profiles: Option<Arc<dyn ProfileSource>>,
    metrics: Option<Metrics>,
}

impl FraudEngineBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: None,
            settings: None,
            transactions: None,
            devices: None,
            alerts: None,
            events: None,
            notifier: None,
            profiles: None,
            metrics: None,
        }
    }

    /// Use an existing rule registry
    pub fn registry(mut self, registry: Arc<RuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Settings store
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(store);
        self
    }

    /// Transaction log
    pub fn transaction_log(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.transactions = Some(log);
        self
    }

    /// Device store
    pub fn device_store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.devices = Some(store);
        self
    }

    /// Alert store
    pub fn alert_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.alerts = Some(store);
        self
    }

    /// Security event sink
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Notification sink
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Behavioral profile source
    pub fn profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    /// Metrics collector
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate configuration and assemble the engine
    pub fn build(self) -> Result<FraudEngine> {
        self.config.validate()?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let registry = RuleRegistry::new();
                match &self.config.rules_path {
                    Some(path) => registry.load_file(path)?,
                    None => registry.publish(default_rules())?,
                };
                Arc::new(registry)
            }
        };

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?,
        };

        let transactions = self
            .transactions
            .unwrap_or_else(|| Arc::new(InMemoryTransactionLog::new(self.config.retention())));
        let alerts = self.alerts.unwrap_or_else(|| Arc::new(InMemoryAlertStore::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(InMemoryEventLog::new()));
        let devices = self.devices.unwrap_or_else(|| Arc::new(InMemoryDeviceStore::new()));

        let policy = DecisionPolicy::new(self.config.thresholds)?;
        let trust_policy = self.config.device_trust.policy();
        trust_policy.validate()?;

        info!(
            "Fraud engine ready: rule set v{}, device promotion after {} clean transactions",
            registry.version(),
            trust_policy.promotion_threshold
        );

        Ok(FraudEngine {
            registry,
            settings: self
                .settings
                .unwrap_or_else(|| Arc::new(InMemorySettingsStore::new())),
            aggregates: AggregateAccessor::new(transactions, self.config.lookback()),
            devices: DeviceTrustTracker::new(devices, trust_policy),
            alert_manager: AlertManager::new(alerts.clone(), events.clone()),
            alerts,
            events,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            profiles: self.profiles.unwrap_or_else(|| Arc::new(StaticProfiles::new())),
            evaluator: RiskEvaluator::new(),
            limits: LimitChecker::new(),
            policy,
            locks: UserLocks::new(),
            metrics,
        })
    }
}

/// Real-time fraud engine
pub struct FraudEngine {
    registry: Arc<RuleRegistry>,
    settings: Arc<dyn SettingsStore>,
    aggregates: AggregateAccessor,
    devices: DeviceTrustTracker,
    alert_manager: AlertManager,
    alerts: Arc<dyn AlertStore>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
    profiles: Arc<dyn ProfileSource>,
    evaluator: RiskEvaluator,
    limits: LimitChecker,
    policy: DecisionPolicy,
    locks: UserLocks,
    metrics: Metrics,
}

impl FraudEngine {
    /// Builder with in-memory collaborators
    pub fn builder(config: Config) -> FraudEngineBuilder {
        FraudEngineBuilder::new(config)
    }

    /// Rule registry
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Evaluate a transaction against the current rule snapshot
    pub fn evaluate(&self, tx: &Transaction, user_id: &str) -> Result<Evaluation> {
        self.evaluate_at(tx, user_id, Utc::now())
    }

    /// Evaluate as of `now`
    pub fn evaluate_at(&self, tx: &Transaction, user_id: &str, now: DateTime<Utc>) -> Result<Evaluation> {
        let snapshot = match self.registry.current_rules() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("Evaluating {} without rules: {}", tx.id, e);
                None
            }
        };
        self.run(snapshot.as_deref(), tx, user_id, now)
    }

    /// Evaluate against a snapshot the caller already holds
    pub fn evaluate_with_snapshot(
        &self,
        snapshot: &RuleSnapshot,
        tx: &Transaction,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        self.run(Some(snapshot), tx, user_id, now)
    }

    fn run(
        &self,
        snapshot: Option<&RuleSnapshot>,
        tx: &Transaction,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Evaluation> {
        let started = Instant::now();
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user_id must not be empty".to_string()));
        }
        tx.validate(now)?;

        let evaluation = self
            .locks
            .with_user(user_id, || self.evaluate_locked(snapshot, tx, user_id, now));

        self.metrics.record_evaluation(
            evaluation.risk_score.decision,
            evaluation.risk_score.degraded,
            started.elapsed().as_secs_f64(),
        );
        Ok(evaluation)
    }

    fn evaluate_locked(
        &self,
        snapshot: Option<&RuleSnapshot>,
        tx: &Transaction,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let (settings, settings_degraded) = match self.settings.get(user_id) {
            Ok(stored) => (stored.unwrap_or_default(), false),
            Err(e) => {
                warn!("Settings unavailable for {}, using defaults: {}", user_id, e);
                (TransactionSecuritySettings::default(), true)
            }
        };

        let history = self
            .aggregates
            .load(user_id, now)
            .map(|history| history.excluding(tx.id))
            .map_err(|e| warn!("Aggregates unavailable for {}: {}", user_id, e))
            .ok();

        let sighting = self
            .devices
            .observe(user_id, &tx.device_id, tx.timestamp)
            .map_err(|e| warn!("Device store unavailable for {}: {}", user_id, e))
            .ok();

        let profile = self.profiles.profile(user_id);

        let ctx = EvaluationContext {
            transaction: tx,
            settings: &settings,
            history: history.as_ref(),
            device: sighting.as_ref(),
            profile: profile.as_ref(),
        };

        let rules = match snapshot {
            Some(snapshot) => self.evaluator.evaluate(snapshot, &ctx),
            None => RuleEvaluation {
                score: Score::new(0),
                factors: Vec::new(),
                forced: Vec::new(),
                alerting_rules: Vec::new(),
                skipped_rules: Vec::new(),
                degraded: true,
            },
        };
        let degraded = rules.degraded || settings_degraded;

        let mut overrides = rules.forced.clone();
        overrides.extend(self.limits.check(tx, &settings, history.as_ref()));

        let outcome = self
            .policy
            .decide(rules.score, &settings.thresholds, &overrides, degraded);

        let risk_score = RiskScore {
            transaction_id: tx.id,
            user_id: user_id.to_string(),
            score: rules.score,
            level: outcome.level,
            factors: rules.factors.clone(),
            decision: outcome.decision,
            overrides,
            degraded,
            rule_set_version: snapshot.map_or(0, |s| s.version),
            computed_at: now,
        };

        let mut effects = Vec::new();
        let event = |event_type: SecurityEventType, details: serde_json::Value| {
            SecurityEvent::new(user_id, event_type, details, now).with_transaction(tx.id)
        };

        if let Some(fault) = &outcome.config_fault {
            effects.push(Effect::AppendSecurityEvent(event(
                SecurityEventType::ConfigurationFault,
                json!({ "error": fault }),
            )));
        }

        if degraded {
            effects.push(Effect::AppendSecurityEvent(event(
                SecurityEventType::DegradedEvaluation,
                json!({
                    "rules_available": snapshot.is_some(),
                    "aggregates_available": history.is_some(),
                    "devices_available": sighting.is_some(),
                    "settings_available": !settings_degraded,
                    "skipped_rules": rules.skipped_rules,
                }),
            )));
        }

        effects.push(Effect::AppendTransactionEvent {
            user_id: user_id.to_string(),
            event: TransactionEvent::from_transaction(tx, risk_score.decision),
        });

        let device = sighting.map(|sighting| {
            if sighting.first_sighting {
                effects.push(Effect::AppendSecurityEvent(event(
                    SecurityEventType::DeviceRegistered,
                    json!({ "fingerprint": sighting.fingerprint.fingerprint_hash }),
                )));
            }
            if sighting.decayed {
                effects.push(Effect::AppendSecurityEvent(event(
                    SecurityEventType::DeviceTrustDecayed,
                    json!({ "fingerprint": sighting.fingerprint.fingerprint_hash }),
                )));
            }

            let (device, change) = self
                .devices
                .apply_outcome(sighting.fingerprint, risk_score.decision, tx.timestamp);
            if change == Some(TrustChange::Promoted) {
                effects.push(Effect::AppendSecurityEvent(event(
                    SecurityEventType::DeviceTrusted,
                    json!({
                        "fingerprint": device.fingerprint_hash,
                        "clean_transactions": device.clean_transaction_count,
                    }),
                )));
            }
            effects.push(Effect::UpsertDevice(device.clone()));
            device
        });

        let alert = AlertManager::alert_for(&risk_score, &rules.alerting_rules);
        if let Some(alert) = &alert {
            effects.push(Effect::UpsertAlert(alert.clone()));
            effects.push(Effect::AppendSecurityEvent(
                event(
                    SecurityEventType::AlertCreated,
                    json!({ "alert_type": alert.alert_type, "severity": alert.severity }),
                )
                .with_alert(alert.id),
            ));
            if let Some(notification) = AlertNotification::for_alert(alert, &settings.notifications) {
                effects.push(Effect::NotifyAlert(notification));
            }
        }

        effects.push(Effect::AppendSecurityEvent(event(
            SecurityEventType::TransactionEvaluated,
            json!({
                "score": risk_score.score,
                "level": risk_score.level,
                "decision": risk_score.decision,
                "degraded": risk_score.degraded,
                "rule_set_version": risk_score.rule_set_version,
            }),
        )));

        for effect in &effects {
            self.apply(effect);
        }

        info!(
            "Transaction {} for {}: score {} ({}), decision {}{}",
            tx.id,
            user_id,
            risk_score.score,
            risk_score.level.as_str(),
            risk_score.decision,
            if risk_score.degraded { " [degraded]" } else { "" }
        );

        Evaluation {
            risk_score,
            alert,
            device,
            effects,
        }
    }

    fn apply(&self, effect: &Effect) {
        let result = match effect {
            Effect::AppendTransactionEvent { user_id, event } => self.aggregates.record(user_id, event.clone()),
            Effect::AppendSecurityEvent(event) => self.events.append(event.clone()),
            Effect::UpsertDevice(device) => self.devices.save(device.clone()),
            Effect::UpsertAlert(alert) => {
                let result = self.alerts.upsert(alert.clone());
                if result.is_ok() {
                    self.metrics.record_alert_opened();
                }
                result
            }
            Effect::NotifyAlert(notification) => {
                self.notifier.notify(notification.clone());
                Ok(())
            }
        };

        if let Err(e) = result {
            self.metrics.record_effect_failure();
            error!("Failed to apply {:?}: {}", effect, e);
        }
    }

    /// Active settings, or the defaults when none were written
    pub fn get_settings(&self, user_id: &str) -> Result<TransactionSecuritySettings> {
        Ok(self.settings.get(user_id)?.unwrap_or_default())
    }

    /// Validate and replace the user's settings
    pub fn put_settings(&self, user_id: &str, settings: TransactionSecuritySettings) -> Result<()> {
        settings.validate()?;

        self.locks.with_user(user_id, || {
            let details = serde_json::to_value(&settings).unwrap_or_default();
            self.settings.put(user_id, settings)?;
            self.events.append(SecurityEvent::new(
                user_id,
                SecurityEventType::SettingsUpdated,
                details,
                Utc::now(),
            ))?;
            info!("Settings updated for {}", user_id);
            Ok(())
        })
    }

    /// Resolve an alert; idempotent for already-resolved alerts
    pub fn resolve_alert(&self, alert_id: Uuid, resolution: &str) -> Result<SecurityAlert> {
        match self.alert_manager.resolve(alert_id, resolution, Utc::now())? {
            ResolveOutcome::Resolved(alert) => {
                self.metrics.record_alert_resolved();
                Ok(alert)
            }
            ResolveOutcome::AlreadyResolved(alert) => Ok(alert),
        }
    }

    /// Fetch one alert
    pub fn alert(&self, alert_id: Uuid) -> Result<SecurityAlert> {
        self.alert_manager.get(alert_id)
    }

    /// All open alerts
    pub fn open_alerts(&self) -> Result<Vec<SecurityAlert>> {
        self.alert_manager.open_alerts()
    }

    /// Every alert of a user
    pub fn alerts_for_user(&self, user_id: &str) -> Result<Vec<SecurityAlert>> {
        self.alert_manager.alerts_for_user(user_id)
    }

    /// Security events of a user
    pub fn events_for_user(&self, user_id: &str) -> Result<Vec<SecurityEvent>> {
        self.alert_manager.events_for_user(user_id)
    }

    /// `touch(userId, deviceId)` outside an evaluation
    pub fn touch_device(&self, user_id: &str, device_id: &str) -> Result<DeviceFingerprint> {
        self.locks
            .with_user(user_id, || self.devices.touch(user_id, device_id, Utc::now()))
    }

    /// Devices known for a user
    pub fn devices_for_user(&self, user_id: &str) -> Result<Vec<DeviceFingerprint>> {
        self.devices.devices(user_id)
    }

    /// Distrust a device and reset its clean streak
    pub fn revoke_device(&self, user_id: &str, device_id: &str) -> Result<DeviceFingerprint> {
        self.locks.with_user(user_id, || {
            let device = self.devices.revoke(user_id, device_id)?;
            self.events.append(SecurityEvent::new(
                user_id,
                SecurityEventType::DeviceRevoked,
                json!({ "fingerprint": device.fingerprint_hash }),
                Utc::now(),
            ))?;
            Ok(device)
        })
    }
}
