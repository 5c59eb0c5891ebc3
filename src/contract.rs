//! Delegation contracts and graduated authority.
//!
//! A contract captures a single delegation's authority: the SLO caps, the
//! tool permission boundary, and the monitoring regime. Authority is
//! graduated by the delegatee's trust tier through a pure mapping with no
//! hidden state: low-trust peers get tightened caps and mandatory
//! verbose checkpoints, elite peers shed non-essential monitoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reputation::TrustTier;
use crate::types::TaskConstraints;

/// Per-contract caps on duration, tokens, cost, and minimum findings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Slo {
    pub max_duration_ms: u64,
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub min_findings: Option<u32>,
}

impl From<&TaskConstraints> for Slo {
    fn from(constraints: &TaskConstraints) -> Self {
        Self {
            max_duration_ms: constraints.max_duration_ms,
            max_tokens: constraints.max_tokens,
            max_cost_usd: constraints.max_cost_usd,
            min_findings: constraints.min_findings,
        }
    }
}

/// Tools the delegatee may touch. An empty allowlist places no
/// restriction; a non-empty one is exhaustive.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionBoundary {
    pub tool_allowlist: Vec<String>,
}

impl PermissionBoundary {
    pub fn allowing<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool_allowlist: tools.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.tool_allowlist.is_empty() || self.tool_allowlist.iter().any(|t| t == tool)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringLevel {
    Minimal,
    Standard,
    Verbose,
}

/// Checkpoint and observation requirements attached to a contract.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Monitoring {
    pub checkpoints_required: bool,
    pub checkpoint_interval_ms: u64,
    pub level: MonitoringLevel,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            checkpoints_required: false,
            checkpoint_interval_ms: 30_000,
            level: MonitoringLevel::Standard,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Active,
    Completed,
    Violated,
    Cancelled,
}

/// The data object capturing one delegation's authority.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DelegationContract {
    pub contract_id: String,
    pub delegator_node_id: String,
    pub delegatee_node_id: String,
    pub task_id: String,
    pub task_text: String,
    pub slo: Slo,
    pub permission_boundary: PermissionBoundary,
    pub monitoring: Monitoring,
    pub status: ContractStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DelegationContract {
    pub fn new(
        delegator_node_id: impl Into<String>,
        delegatee_node_id: impl Into<String>,
        task_id: impl Into<String>,
        task_text: impl Into<String>,
        slo: Slo,
        permission_boundary: PermissionBoundary,
    ) -> Self {
        let now = Utc::now();
        Self {
            contract_id: Uuid::new_v4().to_string(),
            delegator_node_id: delegator_node_id.into(),
            delegatee_node_id: delegatee_node_id.into(),
            task_id: task_id.into(),
            task_text: task_text.into(),
            slo,
            permission_boundary,
            monitoring: Monitoring::default(),
            status: ContractStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the graduated-authority mapping for the delegatee's tier.
    #[must_use]
    pub fn for_tier(mut self, tier: TrustTier) -> Self {
        let (slo, monitoring) = graduated_authority(tier, &self.slo, &self.monitoring);
        self.slo = slo;
        self.monitoring = monitoring;
        self
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ContractStatus::Active)
    }

    fn transition(&mut self, to: ContractStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        true
    }

    /// Each transition succeeds only from `Active`; a terminal contract
    /// stays terminal.
    pub fn mark_completed(&mut self) -> bool {
        self.transition(ContractStatus::Completed)
    }

    pub fn mark_violated(&mut self) -> bool {
        self.transition(ContractStatus::Violated)
    }

    pub fn mark_cancelled(&mut self) -> bool {
        self.transition(ContractStatus::Cancelled)
    }
}

/// Pure mapping from trust tier to tier-adjusted authority.
///
/// | Tier | SLO | Monitoring |
/// |---|---|---|
/// | Low | 0.5× duration, 0.5× tokens, 0.25× cost | verbose, checkpoints mandatory |
/// | Medium | baseline | baseline |
/// | High | 1.5× duration, 2× cost | checkpoints optional |
/// | Elite | as High | minimal, checkpoints optional |
pub fn graduated_authority(tier: TrustTier, base: &Slo, monitoring: &Monitoring) -> (Slo, Monitoring) {
    match tier {
        TrustTier::Low => (
            Slo {
                max_duration_ms: base.max_duration_ms / 2,
                max_tokens: base.max_tokens / 2,
                max_cost_usd: base.max_cost_usd * 0.25,
                min_findings: base.min_findings,
            },
            Monitoring {
                checkpoints_required: true,
                checkpoint_interval_ms: monitoring.checkpoint_interval_ms.min(15_000),
                level: MonitoringLevel::Verbose,
            },
        ),
        TrustTier::Medium => (base.clone(), monitoring.clone()),
        TrustTier::High => (
            relaxed_slo(base),
            Monitoring {
                checkpoints_required: false,
                ..monitoring.clone()
            },
        ),
        TrustTier::Elite => (
            relaxed_slo(base),
            Monitoring {
                checkpoints_required: false,
                checkpoint_interval_ms: monitoring.checkpoint_interval_ms,
                level: MonitoringLevel::Minimal,
            },
        ),
    }
}

fn relaxed_slo(base: &Slo) -> Slo {
    Slo {
        max_duration_ms: base.max_duration_ms.saturating_mul(3) / 2,
        max_tokens: base.max_tokens,
        max_cost_usd: base.max_cost_usd * 2.0,
        min_findings: base.min_findings,
    }
}
