//! Behavioral scoring from inferred per-turn observations.
//!
//! Informational signal that sits alongside reputation: reputation says
//! whether a peer delivers, this says how it conducts itself while
//! working (instruction compliance, useful initiative, safety-flag
//! hits). The pipeline reads it for telemetry; it gates nothing.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// One observed turn of a peer working a delegated task.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TurnObservation {
    /// Did the turn stay within its instructions?
    pub compliant: bool,
    /// Useful-initiative rating in `[0, 1]`.
    pub initiative: f64,
    /// Safety flags tripped this turn.
    pub safety_flags: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BehaviorStats {
    pub turns: u64,
    pub compliant_turns: u64,
    pub initiative_sum: f64,
    pub safety_flags: u64,
}

impl BehaviorStats {
    /// Composite score in `[0, 1]`: compliance weighted 0.5, average
    /// initiative 0.25, absence of safety flags 0.25.
    pub fn composite(&self) -> f64 {
        if self.turns == 0 {
            return 0.5;
        }
        let turns = self.turns as f64;
        let compliance = self.compliant_turns as f64 / turns;
        let initiative = (self.initiative_sum / turns).clamp(0.0, 1.0);
        let safety = 1.0 - (self.safety_flags as f64 / turns).min(1.0);
        (0.5 * compliance + 0.25 * initiative + 0.25 * safety).clamp(0.0, 1.0)
    }
}

#[derive(Default)]
pub struct BehavioralScorer {
    peers: RwLock<FxHashMap<String, BehaviorStats>>,
}

impl BehavioralScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node_id: &str, observation: TurnObservation) {
        let mut peers = self.peers.write();
        let stats = peers.entry(node_id.to_string()).or_default();
        stats.turns += 1;
        if observation.compliant {
            stats.compliant_turns += 1;
        }
        stats.initiative_sum += observation.initiative.clamp(0.0, 1.0);
        stats.safety_flags += u64::from(observation.safety_flags);
    }

    /// Composite score; peers with no observations sit at the neutral 0.5.
    pub fn score(&self, node_id: &str) -> f64 {
        self.peers
            .read()
            .get(node_id)
            .map_or(0.5, BehaviorStats::composite)
    }

    pub fn stats(&self, node_id: &str) -> Option<BehaviorStats> {
        self.peers.read().get(node_id).cloned()
    }
}
