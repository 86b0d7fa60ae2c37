//! Fraud Engine
//!
//! Real-time risk scoring for individual payment transactions.
//!
//! A transaction is checked against a versioned snapshot of validation
//! rules, the user's rolling aggregates, device trust and security
//! settings. The result is a bounded 0-100 score, a risk level and a
//! decision (`allow`, `review`, `require_2fa` or `block`). High-risk
//! outcomes open security alerts, and every evaluation leaves an audit
//! trail in the security event log.
//!
//! # Example
//!
//! ```no_run
//! use fraud_engine::{Config, FraudEngine, Transaction};
//!
//! # fn run(tx: Transaction) -> fraud_engine::Result<()> {
//! let engine = FraudEngine::builder(Config::default()).build()?;
//! let evaluation = engine.evaluate(&tx, "user-42")?;
//! println!("{} -> {}", evaluation.risk_score.score, evaluation.risk_score.decision);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alerts;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod limits;
pub mod metrics;
pub mod notify;
pub mod policy;
pub mod rules;
pub mod scoring;
pub mod settings;
pub mod types;
pub mod velocity;
pub mod worker;

pub use alerts::{AlertManager, AlertType, SecurityAlert, SecurityEvent, SecurityEventType};
pub use config::Config;
pub use devices::{DeviceFingerprint, DeviceTrustTracker};
pub use engine::{Effect, Evaluation, FraudEngine, FraudEngineBuilder};
pub use error::{Error, Result};
pub use limits::LimitChecker;
pub use metrics::Metrics;
pub use policy::DecisionPolicy;
pub use rules::{RuleCondition, RuleRegistry, RuleSnapshot, ValidationRule};
pub use scoring::{BehaviorProfile, RiskEvaluator};
pub use settings::TransactionSecuritySettings;
pub use types::*;
pub use worker::{spawn_engine_worker, EngineHandle};
