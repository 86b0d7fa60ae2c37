//! Hard limit checking
//!
//! Limits come from the user's settings and are compared in the
//! transaction's own currency. A breach yields a `Block` override, never
//! an error.

use crate::settings::TransactionSecuritySettings;
use crate::velocity::UserHistory;
use crate::{Decision, DecisionOverride, OverrideSource, Transaction};
use chrono::Duration;
use rust_decimal::Decimal;

/// Limit checker
#[derive(Debug, Clone, Copy)]
pub struct LimitChecker {
    daily_window: Duration,
}

impl Default for LimitChecker {
    fn default() -> Self {
        Self {
            daily_window: Duration::hours(24),
        }
    }
}

impl LimitChecker {
    /// Create new limit checker
    pub fn new() -> Self {
        Self::default()
    }

    /// All hard-limit overrides for the transaction
    ///
    /// The daily check is skipped when `history` is unavailable.
    pub fn check(
        &self,
        tx: &Transaction,
        settings: &TransactionSecuritySettings,
        history: Option<&UserHistory>,
    ) -> Vec<DecisionOverride> {
        let mut overrides = Vec::new();

        if settings.is_blocked_country(&tx.origin_country) {
            overrides.push(DecisionOverride {
                source: OverrideSource::BlockedCountry {
                    country: tx.origin_country.clone(),
                },
                decision: Decision::Block,
                reason: format!("Origin country {} is blocked", tx.origin_country),
            });
        }

        if let Some(reason) = self.check_single_transaction(tx.amount, settings.max_single_transaction) {
            overrides.push(DecisionOverride {
                source: OverrideSource::SingleTransactionLimit,
                decision: Decision::Block,
                reason,
            });
        }

        if let Some(history) = history {
            let daily_total = history.window_stats(tx.timestamp, self.daily_window).total_amount;
            if let Some(reason) = self.check_daily_limit(tx.amount, daily_total, settings.max_daily_amount) {
                overrides.push(DecisionOverride {
                    source: OverrideSource::DailyLimit,
                    decision: Decision::Block,
                    reason,
                });
            }
        }

        overrides
    }

    /// Check single transaction limit
    pub fn check_single_transaction(&self, amount: Decimal, limit: Option<Decimal>) -> Option<String> {
        let limit = limit?;
        (amount > limit).then(|| {
            format!(
                "Transaction amount {} exceeds single transaction limit {}",
                amount, limit
            )
        })
    }

    /// Check daily limit
    pub fn check_daily_limit(
        &self,
        amount: Decimal,
        daily_total: Decimal,
        limit: Option<Decimal>,
    ) -> Option<String> {
        let limit = limit?;
        (daily_total + amount > limit).then(|| {
            format!(
                "Daily limit {} would be exceeded ({} already spent)",
                limit, daily_total
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velocity::TransactionEvent;
    use crate::Channel;
    use chrono::Utc;
    use uuid::Uuid;

    fn tx(amount: i64, country: &str) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            amount: Decimal::from(amount),
            currency: "USD".to_string(),
            counterparty_id: "shop".to_string(),
            timestamp: Utc::now(),
            device_id: "laptop".to_string(),
            origin_country: country.to_string(),
            channel: Channel::Web,
        }
    }

    #[test]
    fn test_single_transaction_limit() {
        let checker = LimitChecker::new();
        let limit = Some(Decimal::from(5_000));

        assert!(checker.check_single_transaction(Decimal::from(5_000), limit).is_none());
        assert!(checker.check_single_transaction(Decimal::from(9_000), limit).is_some());
        assert!(checker.check_single_transaction(Decimal::from(9_000), None).is_none());
    }

    #[test]
    fn test_daily_limit_uses_counted_history() {
        let checker = LimitChecker::new();
        let settings = TransactionSecuritySettings {
            max_daily_amount: Some(Decimal::from(1_000)),
            ..Default::default()
        };
        let earlier = tx(700, "US");
        let blocked = tx(5_000, "US");
        let history = UserHistory::new(vec![
            TransactionEvent::from_transaction(&earlier, Decision::Allow),
            TransactionEvent::from_transaction(&blocked, Decision::Block),
        ]);

        let overrides = checker.check(&tx(200, "US"), &settings, Some(&history));
        assert!(overrides.is_empty());

        let overrides = checker.check(&tx(400, "US"), &settings, Some(&history));
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].source, OverrideSource::DailyLimit);

        // Without history the daily check cannot run
        assert!(checker.check(&tx(400, "US"), &settings, None).is_empty());
    }

    #[test]
    fn test_blocked_country() {
        let checker = LimitChecker::new();
        let settings = TransactionSecuritySettings {
            blocked_countries: vec!["RU".to_string()],
            max_single_transaction: Some(Decimal::from(100)),
            ..Default::default()
        };

        let overrides = checker.check(&tx(500, "RU"), &settings, None);
        assert_eq!(overrides.len(), 2);
        assert!(overrides.iter().all(|o| o.decision == Decision::Block));
    }
}
