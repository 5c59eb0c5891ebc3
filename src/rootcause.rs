//! Post-hoc failure classification.
//!
//! When a delegation ends badly, the analyzer looks at the task's recent
//! journal window and the peer's reputation to name the most likely
//! cause, and records a `root_cause_identified` event so the planner and
//! dashboard can react.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::journal::{EventKind, Journal, JournalEvent};
use crate::reputation::PeerReputation;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    SloTimeout,
    ToolError,
    ConsensusDissent,
    BondExhausted,
    PeerUnreliable,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RootCauseReport {
    pub task_id: String,
    pub peer_node_id: Option<String>,
    pub cause: RootCause,
    pub description: String,
    /// Event ids that support the classification.
    pub evidence: Vec<String>,
}

/// Classifies failures from the prior event window plus reputation.
pub struct RootCauseAnalyzer {
    journal: Option<Arc<Journal>>,
}

impl Default for RootCauseAnalyzer {
    fn default() -> Self {
        Self { journal: None }
    }
}

impl RootCauseAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record each report as a `root_cause_identified` event.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Classify a failed task from the events that led up to it.
    ///
    /// Checks run in order of specificity: explicit SLO violations win
    /// over tool misuse, which wins over consensus dissent, then escrow
    /// exhaustion, then a pure reputation read.
    pub fn analyze(
        &self,
        task_id: &str,
        window: &[JournalEvent],
        reputation: Option<&PeerReputation>,
    ) -> RootCauseReport {
        let for_task: Vec<&JournalEvent> = window
            .iter()
            .filter(|e| e.payload["task_id"].as_str() == Some(task_id))
            .collect();
        let peer_node_id = for_task
            .iter()
            .find_map(|e| e.payload["node_id"].as_str().or(e.payload["peer_node_id"].as_str()))
            .map(str::to_string)
            .or_else(|| reputation.map(|r| r.node_id.clone()));
        let evidence = |kind: &EventKind| -> Vec<String> {
            for_task
                .iter()
                .filter(|e| &e.kind == kind)
                .map(|e| e.event_id.clone())
                .collect()
        };

        let (cause, description) = if for_task.iter().any(|e| {
            e.kind == EventKind::SloViolation
                && e.payload["issues"]
                    .as_array()
                    .is_some_and(|issues| issues.iter().any(|i| i["issue"] == "duration_exceeded"))
        }) {
            (
                RootCause::SloTimeout,
                "result arrived past the contract's duration cap".to_string(),
            )
        } else if for_task.iter().any(|e| {
            e.kind == EventKind::SloViolation
                && e.payload["issues"]
                    .as_array()
                    .is_some_and(|issues| issues.iter().any(|i| i["issue"] == "tool_not_allowed"))
        }) {
            (
                RootCause::ToolError,
                "worker used a tool outside the permission boundary".to_string(),
            )
        } else if for_task.iter().any(|e| {
            e.kind == EventKind::ConsensusEvaluated && e.payload["agreed"] == false
        }) {
            (
                RootCause::ConsensusDissent,
                "verifiers failed to agree on the result".to_string(),
            )
        } else if for_task
            .iter()
            .any(|e| e.kind == EventKind::Custom("bond_rejected".into()))
        {
            (
                RootCause::BondExhausted,
                "peer could not post the required bond".to_string(),
            )
        } else if reputation.is_some_and(|r| r.consecutive_failures >= 3) {
            (
                RootCause::PeerUnreliable,
                "peer is on a multi-task failure streak".to_string(),
            )
        } else {
            (
                RootCause::Unknown,
                "no classifiable signal in the event window".to_string(),
            )
        };

        let evidence = match cause {
            RootCause::SloTimeout | RootCause::ToolError => evidence(&EventKind::SloViolation),
            RootCause::ConsensusDissent => evidence(&EventKind::ConsensusEvaluated),
            RootCause::BondExhausted => evidence(&EventKind::Custom("bond_rejected".into())),
            RootCause::PeerUnreliable | RootCause::Unknown => Vec::new(),
        };

        let report = RootCauseReport {
            task_id: task_id.to_string(),
            peer_node_id,
            cause,
            description,
            evidence,
        };

        if let Some(journal) = &self.journal {
            let session = window
                .iter()
                .rev()
                .find(|e| e.payload["task_id"].as_str() == Some(task_id))
                .map(|e| e.session_id.clone())
                .unwrap_or_else(|| task_id.to_string());
            journal.try_emit(
                session,
                EventKind::RootCauseIdentified,
                json!({
                    "task_id": report.task_id,
                    "peer_node_id": report.peer_node_id,
                    "cause": report.cause,
                    "description": report.description,
                    "evidence": report.evidence,
                }),
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalEvent;
    use chrono::Utc;

    fn event(kind: EventKind, payload: serde_json::Value) -> JournalEvent {
        JournalEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            session_id: "s".to_string(),
            seq: 0,
            timestamp: Utc::now(),
            kind,
            payload,
            hash_prev: None,
        }
    }

    #[test]
    fn classifies_slo_timeout_first() {
        let window = vec![
            event(
                EventKind::SloViolation,
                json!({ "task_id": "t", "node_id": "p", "issues": [{ "issue": "duration_exceeded" }] }),
            ),
            event(
                EventKind::ConsensusEvaluated,
                json!({ "task_id": "t", "agreed": false }),
            ),
        ];
        let report = RootCauseAnalyzer::new().analyze("t", &window, None);
        assert_eq!(report.cause, RootCause::SloTimeout);
        assert_eq!(report.peer_node_id.as_deref(), Some("p"));
        assert_eq!(report.evidence.len(), 1);
    }

    #[test]
    fn falls_back_to_reputation_streak() {
        let mut rep = PeerReputation::new("p");
        rep.consecutive_failures = 4;
        let report = RootCauseAnalyzer::new().analyze("t", &[], Some(&rep));
        assert_eq!(report.cause, RootCause::PeerUnreliable);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let report = RootCauseAnalyzer::new().analyze("t", &[], None);
        assert_eq!(report.cause, RootCause::Unknown);
    }
}
