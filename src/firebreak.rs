//! The liability firebreak: the hard gate evaluated immediately before
//! dispatch. Unlike friction advice, its verdict is binding.

use serde::{Deserialize, Serialize};

use crate::types::{AttributeLevel, TaskAttributes};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FirebreakAction {
    Allow,
    RequireConfirmation,
    Block,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirebreakDecision {
    pub action: FirebreakAction,
    pub reason: String,
}

/// Blocks high-criticality irreversible work when the delegator is
/// already overextended; demands confirmation for anything that is
/// either high-criticality or irreversible.
#[derive(Clone, Copy, Debug)]
pub struct LiabilityFirebreak {
    /// Outstanding-delegation count above which risky work is blocked
    /// outright instead of confirmed.
    pub outstanding_threshold: usize,
}

impl Default for LiabilityFirebreak {
    fn default() -> Self {
        Self {
            outstanding_threshold: 5,
        }
    }
}

impl LiabilityFirebreak {
    pub fn new(outstanding_threshold: usize) -> Self {
        Self {
            outstanding_threshold,
        }
    }

    pub fn evaluate(&self, attrs: &TaskAttributes, outstanding: usize) -> FirebreakDecision {
        let critical = attrs.criticality == AttributeLevel::High;
        let irreversible = attrs.reversibility == AttributeLevel::Low;

        if critical && irreversible && outstanding > self.outstanding_threshold {
            return FirebreakDecision {
                action: FirebreakAction::Block,
                reason: format!(
                    "critical irreversible task with {outstanding} delegations already in flight"
                ),
            };
        }
        if critical || irreversible {
            let what = if critical { "high criticality" } else { "low reversibility" };
            return FirebreakDecision {
                action: FirebreakAction::RequireConfirmation,
                reason: format!("{what} requires explicit confirmation"),
            };
        }
        FirebreakDecision {
            action: FirebreakAction::Allow,
            reason: "within normal liability bounds".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(criticality: AttributeLevel, reversibility: AttributeLevel) -> TaskAttributes {
        TaskAttributes {
            criticality,
            reversibility,
            ..TaskAttributes::default()
        }
    }

    #[test]
    fn blocks_critical_irreversible_when_overloaded() {
        let firebreak = LiabilityFirebreak::default();
        let decision = firebreak.evaluate(&attrs(AttributeLevel::High, AttributeLevel::Low), 6);
        assert_eq!(decision.action, FirebreakAction::Block);
    }

    #[test]
    fn confirms_when_either_flag_is_set() {
        let firebreak = LiabilityFirebreak::default();

        let decision = firebreak.evaluate(&attrs(AttributeLevel::High, AttributeLevel::Medium), 0);
        assert_eq!(decision.action, FirebreakAction::RequireConfirmation);

        let decision = firebreak.evaluate(&attrs(AttributeLevel::Low, AttributeLevel::Low), 0);
        assert_eq!(decision.action, FirebreakAction::RequireConfirmation);
    }

    #[test]
    fn allows_routine_work() {
        let firebreak = LiabilityFirebreak::default();
        let decision = firebreak.evaluate(&attrs(AttributeLevel::Low, AttributeLevel::High), 10);
        assert_eq!(decision.action, FirebreakAction::Allow);
    }

    #[test]
    fn critical_irreversible_under_threshold_still_confirms() {
        let firebreak = LiabilityFirebreak::default();
        let decision = firebreak.evaluate(&attrs(AttributeLevel::High, AttributeLevel::Low), 3);
        assert_eq!(decision.action, FirebreakAction::RequireConfirmation);
    }
}
