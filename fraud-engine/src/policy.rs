//! Decision policy: score and overrides to level and decision

use crate::settings::RiskThresholds;
use crate::{Decision, DecisionOverride, Error, Result, RiskLevel, Score};
use tracing::warn;

/// Result of [`DecisionPolicy::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    /// Level from score and effective thresholds
    pub level: RiskLevel,

    /// Final decision
    pub decision: Decision,

    /// Thresholds actually applied
    pub thresholds: RiskThresholds,

    /// Set when the user's thresholds were rejected in favor of the defaults
    pub config_fault: Option<String>,
}

/// Pure mapping from score, thresholds and overrides to a decision
#[derive(Debug, Clone, Copy)]
pub struct DecisionPolicy {
    defaults: RiskThresholds,
}

impl DecisionPolicy {
    /// Create policy with system default thresholds
    pub fn new(defaults: RiskThresholds) -> Result<Self> {
        defaults
            .validate()
            .map_err(|e| Error::Config(format!("default thresholds: {}", e)))?;
        Ok(Self { defaults })
    }

    /// System default thresholds
    pub fn defaults(&self) -> RiskThresholds {
        self.defaults
    }

    /// Level on the threshold cuts
    pub fn level_for(score: Score, thresholds: &RiskThresholds) -> RiskLevel {
        let score = score.value();
        if score >= thresholds.auto_block {
            RiskLevel::Critical
        } else if score >= thresholds.require_2fa {
            RiskLevel::High
        } else if score >= thresholds.review {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Decision a level maps to when nothing overrides it
    pub fn decision_for(level: RiskLevel) -> Decision {
        match level {
            RiskLevel::Low => Decision::Allow,
            RiskLevel::Medium => Decision::Review,
            RiskLevel::High => Decision::Require2fa,
            RiskLevel::Critical => Decision::Block,
        }
    }

    /// Map a score to its level and final decision
    ///
    /// Overrides replace the score-derived decision, the most severe one
    /// winning. Degraded evaluations never resolve below `Review`.
    pub fn decide(
        &self,
        score: Score,
        thresholds: &RiskThresholds,
        overrides: &[DecisionOverride],
        degraded: bool,
    ) -> PolicyOutcome {
        let (thresholds, config_fault) = match thresholds.validate() {
            Ok(()) => (*thresholds, None),
            Err(e) => {
                warn!("Falling back to default thresholds: {}", e);
                (self.defaults, Some(e.to_string()))
            }
        };

        let level = Self::level_for(score, &thresholds);
        let mut decision = overrides
            .iter()
            .map(|o| o.decision)
            .max()
            .unwrap_or_else(|| Self::decision_for(level));

        if degraded {
            decision = decision.max(Decision::Review);
        }

        PolicyOutcome {
            level,
            decision,
            thresholds,
            config_fault,
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            defaults: RiskThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverrideSource;

    fn block_override() -> DecisionOverride {
        DecisionOverride {
            source: OverrideSource::SingleTransactionLimit,
            decision: Decision::Block,
            reason: "too large".to_string(),
        }
    }

    #[test]
    fn test_score_cuts() {
        let policy = DecisionPolicy::default();
        let t = RiskThresholds::default();

        let cases = [
            (0, RiskLevel::Low, Decision::Allow),
            (29, RiskLevel::Low, Decision::Allow),
            (30, RiskLevel::Medium, Decision::Review),
            (60, RiskLevel::High, Decision::Require2fa),
            (84, RiskLevel::High, Decision::Require2fa),
            (85, RiskLevel::Critical, Decision::Block),
            (100, RiskLevel::Critical, Decision::Block),
        ];
        for (score, level, decision) in cases {
            let outcome = policy.decide(Score::new(score), &t, &[], false);
            assert_eq!(outcome.level, level, "score {}", score);
            assert_eq!(outcome.decision, decision, "score {}", score);
        }
    }

    #[test]
    fn test_override_wins_over_score() {
        let policy = DecisionPolicy::default();
        let outcome = policy.decide(Score::new(0), &RiskThresholds::default(), &[block_override()], false);

        assert_eq!(outcome.level, RiskLevel::Low);
        assert_eq!(outcome.decision, Decision::Block);
    }

    #[test]
    fn test_most_severe_override_wins() {
        let policy = DecisionPolicy::default();
        let review = DecisionOverride {
            source: OverrideSource::Rule {
                rule_id: "manual".to_string(),
            },
            decision: Decision::Review,
            reason: "watchlist".to_string(),
        };
        let outcome = policy.decide(
            Score::new(10),
            &RiskThresholds::default(),
            &[review, block_override()],
            false,
        );
        assert_eq!(outcome.decision, Decision::Block);
    }

    #[test]
    fn test_degraded_never_allows() {
        let policy = DecisionPolicy::default();
        let outcome = policy.decide(Score::new(5), &RiskThresholds::default(), &[], true);
        assert_eq!(outcome.decision, Decision::Review);

        let outcome = policy.decide(Score::new(90), &RiskThresholds::default(), &[], true);
        assert_eq!(outcome.decision, Decision::Block);
    }

    #[test]
    fn test_invalid_thresholds_fall_back() {
        let policy = DecisionPolicy::default();
        let broken = RiskThresholds {
            review: 70,
            require_2fa: 50,
            auto_block: 90,
        };
        let outcome = policy.decide(Score::new(40), &broken, &[], false);

        assert!(outcome.config_fault.is_some());
        assert_eq!(outcome.thresholds, RiskThresholds::default());
        assert_eq!(outcome.level, RiskLevel::Medium);
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let broken = RiskThresholds {
            review: 90,
            require_2fa: 10,
            auto_block: 50,
        };
        assert!(matches!(DecisionPolicy::new(broken), Err(Error::Config(_))));
    }
}
