//! Routing a subtask to an AI peer, a human, or either.
//!
//! A deterministic rule stack; the first matching rule wins. Scores are
//! the bucketed mappings of the categorical attributes, so routing is a
//! pure function of the analyzed task.

use serde::{Deserialize, Serialize};

use crate::types::{DelegationTarget, TaskAttributes};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub target: DelegationTarget,
    pub confidence: f64,
    pub reasons: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DelegateeRouter;

impl DelegateeRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn route(&self, attrs: &TaskAttributes) -> RoutingDecision {
        let criticality = attrs.criticality.score();
        let reversibility = attrs.reversibility.score();
        let verifiability = attrs.verifiability.score();
        let subjectivity = attrs.subjectivity_score();

        if attrs.delegation_target == Some(DelegationTarget::Human) {
            return RoutingDecision {
                target: DelegationTarget::Human,
                confidence: 1.0,
                reasons: vec!["explicitly marked for human handling".to_string()],
            };
        }
        if criticality > 0.7 && reversibility < 0.3 {
            return RoutingDecision {
                target: DelegationTarget::Human,
                confidence: 0.9,
                reasons: vec![format!(
                    "critical ({criticality:.1}) and hard to reverse ({reversibility:.1})"
                )],
            };
        }
        if verifiability < 0.3 {
            return RoutingDecision {
                target: DelegationTarget::Human,
                confidence: 0.85,
                reasons: vec![format!("outcome is hard to verify ({verifiability:.1})")],
            };
        }
        if subjectivity > 0.7 {
            return RoutingDecision {
                target: DelegationTarget::Human,
                confidence: 0.8,
                reasons: vec![format!("largely subjective ({subjectivity:.1})")],
            };
        }
        if verifiability > 0.7 && criticality < 0.5 {
            return RoutingDecision {
                target: DelegationTarget::Ai,
                confidence: 0.8,
                reasons: vec![format!(
                    "verifiable ({verifiability:.1}) and low stakes ({criticality:.1})"
                )],
            };
        }
        RoutingDecision {
            target: DelegationTarget::Any,
            confidence: 0.6,
            reasons: vec!["no routing rule matched".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeLevel;

    #[test]
    fn explicit_human_override_wins() {
        let attrs = TaskAttributes {
            verifiability: AttributeLevel::High,
            criticality: AttributeLevel::Low,
            delegation_target: Some(DelegationTarget::Human),
            ..TaskAttributes::default()
        };
        let decision = DelegateeRouter::new().route(&attrs);
        assert_eq!(decision.target, DelegationTarget::Human);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn critical_irreversible_goes_to_human() {
        let attrs = TaskAttributes {
            criticality: AttributeLevel::High,
            reversibility: AttributeLevel::Low,
            ..TaskAttributes::default()
        };
        let decision = DelegateeRouter::new().route(&attrs);
        assert_eq!(decision.target, DelegationTarget::Human);
    }

    #[test]
    fn verifiable_low_stakes_goes_to_ai() {
        let attrs = TaskAttributes {
            verifiability: AttributeLevel::High,
            criticality: AttributeLevel::Low,
            ..TaskAttributes::default()
        };
        let decision = DelegateeRouter::new().route(&attrs);
        assert_eq!(decision.target, DelegationTarget::Ai);
    }

    #[test]
    fn unverifiable_goes_to_human_before_subjectivity() {
        // Low verifiability triggers rule 3; the derived subjectivity
        // (0.8) would also match rule 4, but 3 fires first.
        let attrs = TaskAttributes {
            verifiability: AttributeLevel::Low,
            ..TaskAttributes::default()
        };
        let decision = DelegateeRouter::new().route(&attrs);
        assert_eq!(decision.target, DelegationTarget::Human);
        assert_eq!(decision.confidence, 0.85);
    }

    #[test]
    fn middling_task_routes_anywhere() {
        let decision = DelegateeRouter::new().route(&TaskAttributes::default());
        assert_eq!(decision.target, DelegationTarget::Any);
        assert_eq!(decision.confidence, 0.6);
    }
}
