//! Risk scoring over a rule snapshot
//!
//! Every enabled rule is checked in registry order through a single
//! `match` on its [`RuleCondition`]. A triggered rule contributes
//! `round(weight * severity)` with severity in [0, 1]; the score is the
//! clamped sum, so adding a triggered rule never lowers it.

use crate::devices::DeviceSighting;
use crate::rules::{RuleCondition, RuleSnapshot, ValidationRule};
use crate::settings::TransactionSecuritySettings;
use crate::velocity::UserHistory;
use crate::{DecisionOverride, OverrideSource, RiskFactor, Score, Transaction};
use chrono::Duration;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Behavioral summary computed outside the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    /// How far recent behavior sits from the user's norm (0-1)
    pub deviation: f64,

    /// Counterparties the user has paid before
    #[serde(default)]
    pub known_counterparties: HashSet<String>,
}

/// Source of injected behavioral profiles
pub trait ProfileSource: Send + Sync {
    /// Profile for the user, if one has been computed
    fn profile(&self, user_id: &str) -> Option<BehaviorProfile>;
}

/// Profile source backed by a map, filled by the caller
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: DashMap<String, BehaviorProfile>,
}

impl StaticProfiles {
    /// Create empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace a user's profile
    pub fn set(&self, user_id: &str, profile: BehaviorProfile) {
        self.profiles.insert(user_id.to_string(), profile);
    }
}

impl ProfileSource for StaticProfiles {
    fn profile(&self, user_id: &str) -> Option<BehaviorProfile> {
        self.profiles.get(user_id).map(|p| p.value().clone())
    }
}

/// Inputs of one evaluation; `None` marks an unavailable dependency
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    /// Transaction under evaluation
    pub transaction: &'a Transaction,

    /// User settings
    pub settings: &'a TransactionSecuritySettings,

    /// Aggregate history, `None` when the log is unreachable
    pub history: Option<&'a UserHistory>,

    /// Device state, `None` when the device store is unreachable
    pub device: Option<&'a DeviceSighting>,

    /// Behavioral profile, `None` when none is available
    pub profile: Option<&'a BehaviorProfile>,
}

impl EvaluationContext<'_> {
    /// Whether a required dependency was missing
    pub fn is_degraded(&self) -> bool {
        self.history.is_none() || self.device.is_none()
    }
}

/// Scoring output before the decision policy runs
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvaluation {
    /// Clamped score
    pub score: Score,

    /// Factors in registry order
    pub factors: Vec<RiskFactor>,

    /// Overrides from triggered rules carrying `forces_decision`
    pub forced: Vec<DecisionOverride>,

    /// Triggered rules flagged `alert_on_trigger`
    pub alerting_rules: Vec<String>,

    /// Rules skipped for lack of data
    pub skipped_rules: Vec<String>,

    /// One or more dependencies were unavailable
    pub degraded: bool,
}

impl RuleEvaluation {
    /// Whether the given rule triggered
    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.factors.iter().any(|f| f.rule_id == rule_id)
    }
}

enum Check {
    Triggered { severity: f64, detail: String },
    Clear,
    Skipped,
}

/// Stateless rule evaluator
#[derive(Debug, Default, Clone, Copy)]
pub struct RiskEvaluator;

impl RiskEvaluator {
    /// Create evaluator
    pub fn new() -> Self {
        Self
    }

    /// Run the snapshot's enabled rules against the context
    pub fn evaluate(&self, rules: &RuleSnapshot, ctx: &EvaluationContext<'_>) -> RuleEvaluation {
        let mut factors = Vec::new();
        let mut forced = Vec::new();
        let mut alerting_rules = Vec::new();
        let mut skipped_rules = Vec::new();

        for rule in rules.enabled() {
            match check(&rule.condition, ctx) {
                Check::Triggered { severity, detail } => {
                    let factor = factor_for(rule, severity, detail);
                    debug!(
                        "Rule {} triggered for {} (+{})",
                        rule.id, ctx.transaction.id, factor.contribution
                    );

                    if let Some(decision) = rule.forces_decision {
                        forced.push(DecisionOverride {
                            source: OverrideSource::Rule {
                                rule_id: rule.id.clone(),
                            },
                            decision,
                            reason: factor.description.clone(),
                        });
                    }
                    if rule.alert_on_trigger {
                        alerting_rules.push(rule.id.clone());
                    }
                    factors.push(factor);
                }
                Check::Clear => {}
                Check::Skipped => skipped_rules.push(rule.id.clone()),
            }
        }

        let total: i64 = factors.iter().map(|f| f.contribution as i64).sum();

        RuleEvaluation {
            score: Score::clamped(total),
            factors,
            forced,
            alerting_rules,
            skipped_rules,
            degraded: ctx.is_degraded(),
        }
    }
}

fn factor_for(rule: &ValidationRule, severity: f64, detail: String) -> RiskFactor {
    let severity = if severity.is_finite() {
        severity.clamp(0.0, 1.0)
    } else {
        1.0
    };
    RiskFactor {
        rule_id: rule.id.clone(),
        category: rule.category(),
        contribution: (rule.weight as f64 * severity).round() as i32,
        description: format!("{}: {}", rule.name, detail),
    }
}

/// Severity for an observed value over a limit: 0.5 just above it, 1.0 at twice the limit
fn overshoot(observed: Decimal, limit: Decimal) -> f64 {
    if limit <= Decimal::ZERO {
        return 1.0;
    }
    (observed / (limit * Decimal::TWO))
        .to_f64()
        .unwrap_or(1.0)
        .min(1.0)
}

fn check(condition: &RuleCondition, ctx: &EvaluationContext<'_>) -> Check {
    let tx = ctx.transaction;

    match condition {
        RuleCondition::Velocity {
            window_secs,
            max_count,
            max_amount,
        } => {
            let Some(history) = ctx.history else {
                return Check::Skipped;
            };
            let window = Duration::seconds(*window_secs as i64);
            let stats = history.window_stats(tx.timestamp, window);
            let count = stats.count + 1;
            let total = stats.total_amount + tx.amount;

            let mut severity: Option<f64> = None;
            let mut details = Vec::new();
            if let Some(max) = max_count {
                if count > *max {
                    severity = Some(overshoot(Decimal::from(count), Decimal::from(*max)));
                    details.push(format!("{} transactions in {}s (limit {})", count, window_secs, max));
                }
            }
            if let Some(max) = max_amount {
                if total > *max {
                    let s = overshoot(total, *max);
                    severity = Some(severity.map_or(s, |prev| prev.max(s)));
                    details.push(format!("{} moved in {}s (limit {})", total, window_secs, max));
                }
            }

            match severity {
                Some(severity) => Check::Triggered {
                    severity,
                    detail: details.join("; "),
                },
                None => Check::Clear,
            }
        }

        RuleCondition::AmountDeviation {
            lookback_days,
            multiplier,
            min_history,
        } => {
            let Some(history) = ctx.history else {
                return Check::Skipped;
            };
            let lookback = Duration::days(*lookback_days as i64);
            match history.average_amount(tx.timestamp, lookback) {
                Some((average, samples)) if samples >= *min_history => {
                    let limit = average * *multiplier;
                    if tx.amount > limit {
                        Check::Triggered {
                            severity: overshoot(tx.amount, limit),
                            detail: format!(
                                "{} vs average {} over {} transactions",
                                tx.amount,
                                average.round_dp(2),
                                samples
                            ),
                        }
                    } else {
                        Check::Clear
                    }
                }
                _ => Check::Clear,
            }
        }

        RuleCondition::LargeAmount {
            threshold,
            fraction_of_limit,
        } => {
            if ctx.history.is_none() {
                return Check::Skipped;
            }
            let relative = fraction_of_limit
                .zip(ctx.settings.max_single_transaction)
                .map(|(fraction, limit)| fraction * limit);
            let limit = match (*threshold, relative) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => return Check::Clear,
            };

            if tx.amount > limit {
                Check::Triggered {
                    severity: overshoot(tx.amount, limit),
                    detail: format!("{} {} above {}", tx.amount, tx.currency, limit),
                }
            } else {
                Check::Clear
            }
        }

        RuleCondition::NewCountry { novelty_hours } => {
            let Some(history) = ctx.history else {
                return Check::Skipped;
            };
            let cutoff = tx.timestamp - Duration::hours(*novelty_hours as i64);
            let established = history.first_activity().map_or(false, |t| t <= cutoff);
            if !established {
                return Check::Clear;
            }

            match history.country_first_seen(&tx.origin_country) {
                None => Check::Triggered {
                    severity: 1.0,
                    detail: format!("first transaction from {}", tx.origin_country),
                },
                Some(first) if first > cutoff => Check::Triggered {
                    severity: 1.0,
                    detail: format!("{} first seen at {}", tx.origin_country, first),
                },
                Some(_) => Check::Clear,
            }
        }

        RuleCondition::CountryList { countries } => {
            if countries.iter().any(|c| c == &tx.origin_country) {
                Check::Triggered {
                    severity: 1.0,
                    detail: format!("origin {}", tx.origin_country),
                }
            } else {
                Check::Clear
            }
        }

        RuleCondition::CountryNotAllowed => {
            if ctx.settings.is_allowed_country(&tx.origin_country) {
                Check::Clear
            } else {
                Check::Triggered {
                    severity: 1.0,
                    detail: format!("{} not in allowed countries", tx.origin_country),
                }
            }
        }

        RuleCondition::UntrustedDevice {
            known_untrusted_severity,
        } => {
            let Some(device) = ctx.device else {
                return Check::Skipped;
            };
            if device.first_sighting {
                Check::Triggered {
                    severity: 1.0,
                    detail: "first sighting".to_string(),
                }
            } else if !device.fingerprint.trusted && *known_untrusted_severity > 0.0 {
                Check::Triggered {
                    severity: *known_untrusted_severity,
                    detail: format!(
                        "untrusted ({} clean transactions)",
                        device.fingerprint.clean_transaction_count
                    ),
                }
            } else {
                Check::Clear
            }
        }

        RuleCondition::OutsideAllowedHours => match &ctx.settings.time_restrictions {
            Some(restriction) if !restriction.allows(tx.timestamp) => Check::Triggered {
                severity: 1.0,
                detail: format!(
                    "{} outside {:02}:00-{:02}:00",
                    tx.timestamp.format("%a %H:%M UTC"),
                    restriction.start_hour,
                    restriction.end_hour
                ),
            },
            _ => Check::Clear,
        },

        RuleCondition::ProfileDeviation { min_deviation } => match ctx.profile {
            Some(profile) if profile.deviation >= *min_deviation => Check::Triggered {
                severity: profile.deviation,
                detail: format!("deviation {:.2}", profile.deviation),
            },
            _ => Check::Clear,
        },

        RuleCondition::NewCounterparty => match ctx.profile {
            Some(profile) if !profile.known_counterparties.contains(&tx.counterparty_id) => {
                Check::Triggered {
                    severity: 1.0,
                    detail: format!("counterparty {}", tx.counterparty_id),
                }
            }
            _ => Check::Clear,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceFingerprint;
    use crate::rules::{default_rules, RuleRegistry};
    use crate::settings::TimeRestriction;
    use crate::velocity::TransactionEvent;
    use crate::{Channel, Decision, RuleCategory};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    fn tx(amount: i64, country: &str, at: DateTime<Utc>) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            amount: Decimal::from(amount),
            currency: "USD".to_string(),
            counterparty_id: "merchant-1".to_string(),
            timestamp: at,
            device_id: "phone".to_string(),
            origin_country: country.to_string(),
            channel: Channel::Mobile,
        }
    }

    fn sighting(first: bool, trusted: bool) -> DeviceSighting {
        let now = Utc::now();
        DeviceSighting {
            fingerprint: DeviceFingerprint {
                id: Uuid::new_v4(),
                user_id: "alice".to_string(),
                fingerprint_hash: "ab".repeat(32),
                trusted,
                first_seen: now,
                last_seen: now,
                clean_transaction_count: 0,
                trusted_at: None,
            },
            first_sighting: first,
            decayed: false,
        }
    }

    fn snapshot() -> Arc<RuleSnapshot> {
        RuleRegistry::with_rules(default_rules())
            .unwrap()
            .current_rules()
            .unwrap()
    }

    fn history_of(txs: &[Transaction]) -> UserHistory {
        UserHistory::new(
            txs.iter()
                .map(|t| TransactionEvent::from_transaction(t, Decision::Allow))
                .collect(),
        )
    }

    #[test]
    fn test_new_device_small_amount_low_score() {
        let now = Utc::now();
        let t = tx(50, "US", now);
        let settings = TransactionSecuritySettings::default();
        let history = UserHistory::default();
        let device = sighting(true, false);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );

        assert_eq!(result.score.value(), 15);
        assert_eq!(result.factors.len(), 1);
        assert_eq!(result.factors[0].category, RuleCategory::Device);
        assert!(!result.degraded);
    }

    #[test]
    fn test_velocity_burst_and_new_country() {
        let now = Utc::now();
        let mut past: Vec<Transaction> = (0..3)
            .map(|i| tx(100, "US", now - Duration::days(3) + Duration::minutes(i)))
            .collect();
        past.extend((0..9).map(|i| tx(100, "BR", now - Duration::seconds(200 - i * 20))));
        let history = history_of(&past);

        let t = tx(100, "BR", now);
        let settings = TransactionSecuritySettings::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );

        assert!(result.has_rule("velocity-burst"));
        assert!(result.has_rule("geo-new-country"));
        // 10 in window vs limit 5 -> full weight 35, plus 30 for the new country
        assert_eq!(result.score.value(), 65);
    }

    #[test]
    fn test_new_country_needs_established_history() {
        let now = Utc::now();
        let history = history_of(&[tx(100, "US", now - Duration::hours(2))]);
        let t = tx(100, "FR", now);
        let settings = TransactionSecuritySettings::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );
        assert!(!result.has_rule("geo-new-country"));
    }

    #[test]
    fn test_amount_deviation() {
        let now = Utc::now();
        let past: Vec<_> = (1..=4).map(|i| tx(100, "US", now - Duration::days(i))).collect();
        let history = history_of(&past);
        let t = tx(1_000, "US", now);
        let settings = TransactionSecuritySettings::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );
        // 1000 vs limit 300 -> capped severity 1.0
        let factor = result
            .factors
            .iter()
            .find(|f| f.rule_id == "amount-deviation")
            .unwrap();
        assert_eq!(factor.contribution, 25);
    }

    #[test]
    fn test_missing_aggregates_degrades_and_skips() {
        let now = Utc::now();
        let t = tx(50_000, "US", now);
        let settings = TransactionSecuritySettings::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: None,
                device: Some(&device),
                profile: None,
            },
        );

        assert!(result.degraded);
        assert!(!result.factors.iter().any(|f| f.category.needs_aggregates()));
        assert!(result.skipped_rules.contains(&"velocity-burst".to_string()));
        assert!(result.skipped_rules.contains(&"amount-large".to_string()));
    }

    #[test]
    fn test_missing_device_store_degrades() {
        let t = tx(50, "US", Utc::now());
        let settings = TransactionSecuritySettings::default();
        let history = UserHistory::default();

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: None,
                profile: None,
            },
        );
        assert!(result.degraded);
        assert_eq!(result.skipped_rules, vec!["device-untrusted".to_string()]);
    }

    #[test]
    fn test_sanctioned_country_forces_block_and_alerts() {
        let t = tx(50, "KP", Utc::now());
        let settings = TransactionSecuritySettings::default();
        let history = UserHistory::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );
        assert_eq!(result.forced.len(), 1);
        assert_eq!(result.forced[0].decision, Decision::Block);
        assert_eq!(result.alerting_rules, vec!["geo-sanctioned".to_string()]);
    }

    #[test]
    fn test_settings_driven_rules() {
        // 15:30 UTC, well outside the 00:00-01:00 window
        let now = Utc.with_ymd_and_hms(2024, 3, 14, 15, 30, 0).unwrap();
        let t = tx(4_500, "GB", now);
        let settings = TransactionSecuritySettings {
            max_single_transaction: Some(Decimal::from(5_000)),
            allowed_countries: vec!["US".to_string()],
            time_restrictions: Some(TimeRestriction {
                start_hour: 0,
                end_hour: 1,
                utc_offset_minutes: 0,
                allowed_days: vec![],
            }),
            ..Default::default()
        };
        let history = UserHistory::default();
        let device = sighting(false, true);

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );

        assert!(result.has_rule("amount-near-limit"));
        assert!(result.has_rule("geo-not-allowed"));
        assert!(result.has_rule("time-outside-window"));

        let inside = tx(4_500, "GB", Utc.with_ymd_and_hms(2024, 3, 14, 0, 30, 0).unwrap());
        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &inside,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: None,
            },
        );
        assert!(!result.has_rule("time-outside-window"));
    }

    #[test]
    fn test_behavior_rules_use_profile() {
        let t = tx(50, "US", Utc::now());
        let settings = TransactionSecuritySettings::default();
        let history = UserHistory::default();
        let device = sighting(false, true);
        let profile = BehaviorProfile {
            deviation: 0.8,
            known_counterparties: HashSet::from(["someone-else".to_string()]),
        };

        let result = RiskEvaluator::new().evaluate(
            &snapshot(),
            &EvaluationContext {
                transaction: &t,
                settings: &settings,
                history: Some(&history),
                device: Some(&device),
                profile: Some(&profile),
            },
        );
        // round(25 * 0.8) + 10
        assert_eq!(result.score.value(), 30);
    }

    #[test]
    fn test_static_profiles() {
        let profiles = StaticProfiles::new();
        assert!(profiles.profile("alice").is_none());
        profiles.set("alice", BehaviorProfile::default());
        assert!(profiles.profile("alice").is_some());
    }
}
