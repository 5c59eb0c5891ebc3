//! Shared data model for the delegation mesh.
//!
//! These are the types that cross component boundaries: node identity,
//! task attributes, delegation constraints, and the request/result pair
//! exchanged between peers. Components that own richer state (peer table,
//! reputation counters, escrow accounts) define those types locally and
//! hold only the identifiers declared here.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a mesh node for its lifetime.
///
/// Owned by the local mesh manager; copies flow to peers via gossip and
/// the hello exchange. Capabilities are an unordered set of opaque
/// capability strings (`"read-file"`, `"shell"`, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub display_name: String,
    pub api_url: String,
    pub capabilities: BTreeSet<String>,
    pub version: String,
}

impl NodeIdentity {
    pub fn new(display_name: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            api_url: api_url.into(),
            capabilities: BTreeSet::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Host portion of `api_url`, used for sybil IP-cluster checks.
    pub fn api_host(&self) -> &str {
        let stripped = self
            .api_url
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let end = stripped
            .find([':', '/'])
            .unwrap_or(stripped.len());
        &stripped[..end]
    }
}

/// Categorical level used across task attributes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AttributeLevel {
    Low,
    Medium,
    High,
}

impl AttributeLevel {
    /// Bucketed numeric score for routing rules.
    pub fn score(self) -> f64 {
        match self {
            AttributeLevel::Low => 0.2,
            AttributeLevel::Medium => 0.5,
            AttributeLevel::High => 0.9,
        }
    }
}

/// Routing target for a subtask.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelegationTarget {
    Ai,
    Human,
    Any,
}

/// Analyzed attributes of a (sub)task, produced by the decomposer and
/// consumed by the router, friction engine, and firebreak.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskAttributes {
    pub complexity: AttributeLevel,
    pub criticality: AttributeLevel,
    pub verifiability: AttributeLevel,
    pub reversibility: AttributeLevel,
    pub estimated_cost_usd: f64,
    pub estimated_duration_ms: u64,
    /// Explicit routing override. `Some(Human)` is set by the decomposer
    /// for subjective subtasks and wins over every routing rule.
    pub delegation_target: Option<DelegationTarget>,
}

impl Default for TaskAttributes {
    fn default() -> Self {
        Self {
            complexity: AttributeLevel::Medium,
            criticality: AttributeLevel::Medium,
            verifiability: AttributeLevel::Medium,
            reversibility: AttributeLevel::Medium,
            estimated_cost_usd: 0.0,
            estimated_duration_ms: 0,
            delegation_target: None,
        }
    }
}

impl TaskAttributes {
    /// Subjectivity is the inverse of verifiability: a task nobody can
    /// verify mechanically is one a human should judge.
    pub fn subjectivity_score(&self) -> f64 {
        1.0 - self.verifiability.score()
    }
}

/// Resource caps a delegator imposes on a delegated task.
///
/// The decomposer attenuates these evenly across subtasks; the contract
/// machinery turns them into a graduated SLO.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskConstraints {
    pub max_duration_ms: u64,
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    /// Tools the delegatee may invoke. Propagates to subtasks unchanged.
    pub tool_allowlist: Vec<String>,
    pub min_findings: Option<u32>,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            max_duration_ms: 60_000,
            max_tokens: 100_000,
            max_cost_usd: 1.0,
            tool_allowlist: Vec::new(),
            min_findings: None,
        }
    }
}

/// One step summary produced by a worker while executing a task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub tool_name: String,
    pub summary: String,
}

impl Finding {
    pub fn new(tool_name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            summary: summary.into(),
        }
    }
}

/// Terminal status of a delegated task.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Aborted,
}

/// Request an originator sends to a worker peer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SwarmTaskRequest {
    pub task_id: String,
    pub session_id: String,
    pub task_text: String,
    pub constraints: TaskConstraints,
    pub originator: NodeIdentity,
}

impl SwarmTaskRequest {
    pub fn new(
        session_id: impl Into<String>,
        task_text: impl Into<String>,
        constraints: TaskConstraints,
        originator: NodeIdentity,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            task_text: task_text.into(),
            constraints,
            originator,
        }
    }
}

/// Result a worker delivers back to the originator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SwarmTaskResult {
    pub task_id: String,
    pub peer_node_id: String,
    pub status: TaskStatus,
    pub findings: Vec<Finding>,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl SwarmTaskResult {
    pub fn completed(task_id: impl Into<String>, peer_node_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            peer_node_id: peer_node_id.into(),
            status: TaskStatus::Completed,
            findings: Vec::new(),
            tokens_used: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(task_id: impl Into<String>, peer_node_id: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            ..Self::completed(task_id, peer_node_id)
        }
    }

    #[must_use]
    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64, duration_ms: u64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self.duration_ms = duration_ms;
        self
    }
}

/// Broadcast request-for-quotes inviting peers to bid on a task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rfq {
    pub rfq_id: String,
    pub task_text: String,
    pub originator_node_id: String,
    pub bid_deadline: DateTime<Utc>,
    pub constraints: TaskConstraints,
    pub required_capabilities: BTreeSet<String>,
}

/// A peer's offer to execute an RFQ'd task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Bid {
    pub bid_id: String,
    pub rfq_id: String,
    pub bidder_node_id: String,
    pub estimated_cost_usd: f64,
    pub estimated_duration_ms: u64,
    pub estimated_tokens: u64,
    pub capabilities_offered: BTreeSet<String>,
    pub round: u32,
    pub nonce: u64,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_host_strips_scheme_port_and_path() {
        let id = NodeIdentity::new("a", "http://10.0.0.7:8080/api");
        assert_eq!(id.api_host(), "10.0.0.7");

        let id = NodeIdentity::new("b", "https://mesh.example.com/peer");
        assert_eq!(id.api_host(), "mesh.example.com");
    }

    #[test]
    fn attribute_scores_are_bucketed() {
        assert_eq!(AttributeLevel::Low.score(), 0.2);
        assert_eq!(AttributeLevel::Medium.score(), 0.5);
        assert_eq!(AttributeLevel::High.score(), 0.9);
    }

    #[test]
    fn subjectivity_inverts_verifiability() {
        let attrs = TaskAttributes {
            verifiability: AttributeLevel::Low,
            ..TaskAttributes::default()
        };
        assert!((attrs.subjectivity_score() - 0.8).abs() < f64::EPSILON);
    }
}
