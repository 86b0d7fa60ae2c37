//! End-to-end evaluation scenarios against the in-memory engine

use chrono::{DateTime, Duration, Utc};
use fraud_engine::alerts::{AlertType, SecurityEventType};
use fraud_engine::rules::default_rules;
use fraud_engine::settings::{RiskThresholds, SettingsStore};
use fraud_engine::velocity::{TransactionEvent, TransactionLog};
use fraud_engine::{
    Channel, Config, Decision, Error, FraudEngine, OverrideSource, RiskLevel, RuleCategory, RuleCondition,
    Transaction, TransactionSecuritySettings, ValidationRule,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

fn engine() -> FraudEngine {
    FraudEngine::builder(Config::default()).build().unwrap()
}

fn tx(amount: i64, country: &str, device: &str, at: DateTime<Utc>) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        amount: Decimal::from(amount),
        currency: "USD".to_string(),
        counterparty_id: "merchant-7".to_string(),
        timestamp: at,
        device_id: device.to_string(),
        origin_country: country.to_string(),
        channel: Channel::Web,
    }
}

/// Five clean US transactions two days ago, enough to trust `device`
fn seed_trusted_device(engine: &FraudEngine, user: &str, device: &str, now: DateTime<Utc>) {
    let start = now - Duration::days(2);
    for i in 0..5 {
        let evaluation = engine
            .evaluate_at(&tx(100, "US", device, start + Duration::minutes(10 * i)), user, now)
            .unwrap();
        assert_eq!(evaluation.risk_score.decision, Decision::Allow);
    }
    let devices = engine.devices_for_user(user).unwrap();
    assert!(devices[0].trusted);
}

struct UnreachableLog;

impl TransactionLog for UnreachableLog {
    fn append(&self, _user_id: &str, _event: TransactionEvent) -> fraud_engine::Result<()> {
        Err(Error::DependencyUnavailable("log offline".to_string()))
    }

    fn history(&self, _user_id: &str, _since: DateTime<Utc>) -> fraud_engine::Result<Vec<TransactionEvent>> {
        Err(Error::DependencyUnavailable("log offline".to_string()))
    }
}

/// Store holding thresholds that were written around validation
struct LegacySettings;

impl SettingsStore for LegacySettings {
    fn get(&self, _user_id: &str) -> fraud_engine::Result<Option<TransactionSecuritySettings>> {
        Ok(Some(TransactionSecuritySettings {
            thresholds: RiskThresholds {
                review: 10,
                require_2fa: 5,
                auto_block: 90,
            },
            ..Default::default()
        }))
    }

    fn put(&self, _user_id: &str, _settings: TransactionSecuritySettings) -> fraud_engine::Result<()> {
        Ok(())
    }
}

#[test]
fn new_device_small_amount_is_allowed() {
    let engine = engine();
    let evaluation = engine.evaluate(&tx(50, "US", "phone", Utc::now()), "alice").unwrap();
    let score = &evaluation.risk_score;

    assert_eq!(score.level, RiskLevel::Low);
    assert_eq!(score.decision, Decision::Allow);
    assert!(score.score.value() < 30);
    assert!(score.has_category(RuleCategory::Device));
    assert!(!score.degraded);
    assert!(evaluation.alert.is_none());
}

#[test]
fn single_transaction_limit_forces_block() {
    let engine = engine();
    let now = Utc::now();
    engine
        .put_settings(
            "bob",
            TransactionSecuritySettings {
                max_single_transaction: Some(Decimal::from(5_000)),
                ..Default::default()
            },
        )
        .unwrap();
    seed_trusted_device(&engine, "bob", "laptop", now);

    let evaluation = engine.evaluate_at(&tx(9_000, "US", "laptop", now), "bob", now).unwrap();
    let score = &evaluation.risk_score;

    assert_eq!(score.decision, Decision::Block);
    assert!(score.level < RiskLevel::Critical);
    assert!(score
        .overrides
        .iter()
        .any(|o| o.source == OverrideSource::SingleTransactionLimit));
}

#[test]
fn burst_from_unseen_country_requires_2fa_and_alerts() {
    let engine = engine();
    let now = Utc::now();
    seed_trusted_device(&engine, "carol", "laptop", now);

    let start = now - Duration::seconds(180);
    let mut last = None;
    for i in 0..10 {
        let t = tx(100, "BR", "laptop", start + Duration::seconds(20 * i));
        last = Some(engine.evaluate_at(&t, "carol", now).unwrap());
    }
    let evaluation = last.unwrap();
    let score = &evaluation.risk_score;

    assert!(score.has_category(RuleCategory::Velocity));
    assert!(score.has_category(RuleCategory::Geography));
    assert!(score.score.value() >= 60);
    assert_eq!(score.level, RiskLevel::High);
    assert_eq!(score.decision, Decision::Require2fa);

    let alert = evaluation.alert.clone().unwrap();
    assert_eq!(alert.severity, RiskLevel::High);
    assert_eq!(alert.alert_type, AlertType::HighRiskScore);
    assert!(!alert.resolved);
    assert_eq!(engine.alert(alert.id).unwrap(), alert);
}

#[test]
fn resolving_alert_is_idempotent() {
    let engine = engine();
    let now = Utc::now();
    seed_trusted_device(&engine, "dave", "laptop", now);

    let start = now - Duration::seconds(180);
    let mut alert = None;
    for i in 0..10 {
        let t = tx(100, "BR", "laptop", start + Duration::seconds(20 * i));
        alert = engine.evaluate_at(&t, "dave", now).unwrap().alert.or(alert);
    }
    let alert = alert.unwrap();

    let resolved = engine.resolve_alert(alert.id, "confirmed legitimate").unwrap();
    assert!(resolved.resolved);
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.resolution.as_deref(), Some("confirmed legitimate"));

    let again = engine.resolve_alert(alert.id, "second attempt").unwrap();
    assert_eq!(again, resolved);

    let resolutions = engine
        .events_for_user("dave")
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::AlertResolved)
        .count();
    assert_eq!(resolutions, 1);
    assert_eq!(engine.metrics().alerts_resolved.get(), 1);

    assert!(matches!(
        engine.resolve_alert(Uuid::new_v4(), "confirmed legitimate"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn in_flight_evaluation_keeps_its_snapshot() {
    let engine = engine();
    let now = Utc::now();
    let held = engine.registry().current_rules().unwrap();

    let mut rules = default_rules();
    rules.push(
        ValidationRule::new(
            "geo-blocked-br",
            "Blocked origin",
            RuleCondition::CountryList {
                countries: vec!["BR".to_string()],
            },
            40,
        )
        .forcing(Decision::Block),
    );
    assert_eq!(engine.registry().publish(rules).unwrap(), 2);

    let in_flight = engine
        .evaluate_with_snapshot(&held, &tx(50, "BR", "phone", now), "erin", now)
        .unwrap();
    assert_eq!(in_flight.risk_score.rule_set_version, 1);
    assert_ne!(in_flight.risk_score.decision, Decision::Block);

    let next = engine.evaluate_at(&tx(50, "BR", "phone", now), "erin", now).unwrap();
    assert_eq!(next.risk_score.rule_set_version, 2);
    assert_eq!(next.risk_score.decision, Decision::Block);
}

#[test]
fn blocked_country_always_blocks() {
    let engine = engine();
    engine
        .put_settings(
            "frank",
            TransactionSecuritySettings {
                blocked_countries: vec!["RU".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

    let evaluation = engine.evaluate(&tx(5, "RU", "phone", Utc::now()), "frank").unwrap();
    assert_eq!(evaluation.risk_score.decision, Decision::Block);
    assert_eq!(evaluation.risk_score.level, RiskLevel::Low);
}

#[test]
fn unreachable_aggregates_degrade_to_review() {
    let engine = FraudEngine::builder(Config::default())
        .transaction_log(Arc::new(UnreachableLog))
        .build()
        .unwrap();

    let evaluation = engine.evaluate(&tx(50, "US", "phone", Utc::now()), "gina").unwrap();
    let score = &evaluation.risk_score;

    assert!(score.degraded);
    assert_eq!(score.decision, Decision::Review);
    assert!(!score.has_category(RuleCategory::Velocity));
    assert!(engine
        .events_for_user("gina")
        .unwrap()
        .iter()
        .any(|e| e.event_type == SecurityEventType::DegradedEvaluation));
    assert_eq!(engine.metrics().effect_failures.get(), 1);
}

#[test]
fn device_trusted_only_after_clean_streak() {
    let mut config = Config::default();
    config.device_trust.promotion_threshold = 3;
    let engine = FraudEngine::builder(config).build().unwrap();
    let now = Utc::now();

    for i in 0..2 {
        engine
            .evaluate_at(&tx(20, "US", "tablet", now - Duration::hours(3 - i)), "hank", now)
            .unwrap();
        assert!(!engine.devices_for_user("hank").unwrap()[0].trusted);
    }

    let evaluation = engine
        .evaluate_at(&tx(20, "US", "tablet", now - Duration::hours(1)), "hank", now)
        .unwrap();
    assert!(evaluation.device.as_ref().unwrap().trusted);
    assert!(evaluation
        .security_events()
        .any(|e| e.event_type == SecurityEventType::DeviceTrusted));

    let revoked = engine.revoke_device("hank", "tablet").unwrap();
    assert!(!revoked.trusted);
    assert_eq!(revoked.clean_transaction_count, 0);
}

#[test]
fn users_never_share_aggregates() {
    let engine = Arc::new(engine());
    let now = Utc::now();

    let workers: Vec<_> = ["ivy", "jack"]
        .into_iter()
        .map(|user| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..6 {
                    let t = tx(10, "US", "phone", now - Duration::seconds(100 - i * 10));
                    engine.evaluate_at(&t, user, now).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for user in ["ivy", "jack"] {
        let evaluated = engine
            .events_for_user(user)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == SecurityEventType::TransactionEvaluated)
            .count();
        assert_eq!(evaluated, 6);

        let evaluation = engine.evaluate_at(&tx(10, "US", "phone", now), user, now).unwrap();
        let burst = evaluation
            .risk_score
            .factors
            .iter()
            .find(|f| f.rule_id == "velocity-burst")
            .unwrap();
        assert!(burst.description.contains("7 transactions"), "{}", burst.description);
    }

    let fresh = engine.evaluate(&tx(10, "US", "phone", now), "kim").unwrap();
    assert!(!fresh.risk_score.has_category(RuleCategory::Velocity));
}

#[test]
fn re_evaluating_a_transaction_counts_it_once() {
    let engine = engine();
    let now = Utc::now();
    engine
        .put_settings(
            "lena",
            TransactionSecuritySettings {
                max_daily_amount: Some(Decimal::from(1_000)),
                ..Default::default()
            },
        )
        .unwrap();

    let large = tx(600, "US", "phone", now - Duration::minutes(2));
    let first = engine.evaluate_at(&large, "lena", now).unwrap();
    let second = engine.evaluate_at(&large, "lena", now).unwrap();
    assert_eq!(first.risk_score.decision, Decision::Allow);
    assert_eq!(second.risk_score.decision, first.risk_score.decision);
    assert!(second.risk_score.overrides.is_empty());

    for i in 0..5 {
        let t = tx(10, "US", "phone", now - Duration::seconds(100 - i * 10));
        engine.evaluate_at(&t, "lena", now).unwrap();
    }
    let seventh = tx(10, "US", "phone", now);
    let burst = |evaluation: &fraud_engine::Evaluation| {
        evaluation
            .risk_score
            .factors
            .iter()
            .find(|f| f.rule_id == "velocity-burst")
            .map(|f| f.description.clone())
    };
    let once = burst(&engine.evaluate_at(&seventh, "lena", now).unwrap());
    let again = burst(&engine.evaluate_at(&seventh, "lena", now).unwrap());
    assert!(once.as_deref().unwrap().contains("7 transactions"), "{:?}", once);
    assert_eq!(once, again);
}

#[test]
fn invalid_stored_thresholds_fall_back_to_defaults() {
    let engine = FraudEngine::builder(Config::default())
        .settings_store(Arc::new(LegacySettings))
        .build()
        .unwrap();

    // A new device alone scores 15: medium under the stored cuts, low under the defaults
    let evaluation = engine.evaluate(&tx(50, "US", "phone", Utc::now()), "mia").unwrap();
    let score = &evaluation.risk_score;
    assert_eq!(score.score.value(), 15);
    assert_eq!(score.level, RiskLevel::Low);
    assert_eq!(score.decision, Decision::Allow);
    assert!(!score.degraded);

    let faults: Vec<_> = engine
        .events_for_user("mia")
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::ConfigurationFault)
        .collect();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].transaction_id, Some(evaluation.risk_score.transaction_id));
}
