//! Cognitive friction: "should we hesitate before delegating this?"
//!
//! The engine folds task attributes and the current delegation context
//! into a composite score and maps it to a band. The output is advice
//! for the planner; it never blocks on its own — the firebreak does the
//! blocking.

use serde::{Deserialize, Serialize};

use crate::types::TaskAttributes;

/// How hesitant the delegator should be.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum FrictionLevel {
    Low,
    Standard,
    Elevated,
    High,
    Critical,
}

impl FrictionLevel {
    fn from_score(score: f64) -> Self {
        if score < 0.2 {
            FrictionLevel::Low
        } else if score < 0.4 {
            FrictionLevel::Standard
        } else if score < 0.6 {
            FrictionLevel::Elevated
        } else if score < 0.8 {
            FrictionLevel::High
        } else {
            FrictionLevel::Critical
        }
    }
}

/// Delegator-side context at assessment time.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrictionContext {
    /// Delegations currently in flight from this node.
    pub outstanding_delegations: usize,
    /// Trust score of the candidate delegatee.
    pub peer_trust: f64,
    /// Failed delegations in the recent window.
    pub recent_failures: usize,
}

/// The engine's advice: a band, the raw score behind it, and a reason
/// string that is deterministic given the inputs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrictionAdvice {
    pub level: FrictionLevel,
    pub score: f64,
    pub reason: String,
}

/// Weighted composite of attribute and context pressure.
#[derive(Clone, Copy, Debug, Default)]
pub struct CognitiveFrictionEngine;

impl CognitiveFrictionEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, attrs: &TaskAttributes, ctx: &FrictionContext) -> FrictionAdvice {
        let load = (ctx.outstanding_delegations as f64 / 10.0).min(1.0);
        let failures = (ctx.recent_failures as f64 / 5.0).min(1.0);
        let distrust = (1.0 - ctx.peer_trust).clamp(0.0, 1.0);

        // (label, weight, signal) triples; the weights sum to 1.0.
        let contributions = [
            ("criticality", 0.25, attrs.criticality.score()),
            ("irreversibility", 0.20, 1.0 - attrs.reversibility.score()),
            ("unverifiability", 0.15, 1.0 - attrs.verifiability.score()),
            ("complexity", 0.10, attrs.complexity.score()),
            ("peer distrust", 0.10, distrust),
            ("delegation load", 0.10, load),
            ("recent failures", 0.10, failures),
        ];

        let score: f64 = contributions.iter().map(|(_, w, s)| w * s).sum();
        let score = score.clamp(0.0, 1.0);

        // Reason names the three largest contributors, largest first.
        // Ties break by label so the string is reproducible.
        let mut ranked: Vec<(&str, f64)> = contributions
            .iter()
            .map(|(label, w, s)| (*label, w * s))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let reason = ranked
            .iter()
            .take(3)
            .map(|(label, contribution)| format!("{label} {contribution:.2}"))
            .collect::<Vec<_>>()
            .join(", ");

        FrictionAdvice {
            level: FrictionLevel::from_score(score),
            score,
            reason,
        }
    }
}
