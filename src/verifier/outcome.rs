//! SLO compliance check of a delivered result against its contract.

use serde::{Deserialize, Serialize};

use crate::contract::DelegationContract;
use crate::types::{SwarmTaskResult, TaskStatus};

/// One way a result missed its contract.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum SloIssue {
    NotCompleted {
        status: TaskStatus,
    },
    DurationExceeded {
        actual_ms: u64,
        cap_ms: u64,
    },
    TokensExceeded {
        actual: u64,
        cap: u64,
    },
    CostExceeded {
        actual_usd: f64,
        cap_usd: f64,
    },
    TooFewFindings {
        found: usize,
        required: u32,
    },
    ToolNotAllowed {
        tool_name: String,
    },
}

/// Verdict on one result.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VerificationReport {
    /// Whether the delegator should accept the result.
    pub verified: bool,
    /// Whether every SLO cap and the tool boundary were honored.
    pub slo_compliance: bool,
    pub issues: Vec<SloIssue>,
}

/// Checks a result against its contract's SLO and permission boundary.
///
/// In strict mode (the default) any violation fails verification. In
/// non-strict mode the issues are still reported but a completed result
/// verifies.
#[derive(Clone, Copy, Debug)]
pub struct OutcomeVerifier {
    strict: bool,
}

impl Default for OutcomeVerifier {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl OutcomeVerifier {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn verify(
        &self,
        contract: &DelegationContract,
        result: &SwarmTaskResult,
    ) -> VerificationReport {
        let mut issues = Vec::new();

        if result.status != TaskStatus::Completed {
            issues.push(SloIssue::NotCompleted {
                status: result.status,
            });
        }
        if result.duration_ms > contract.slo.max_duration_ms {
            issues.push(SloIssue::DurationExceeded {
                actual_ms: result.duration_ms,
                cap_ms: contract.slo.max_duration_ms,
            });
        }
        if result.tokens_used > contract.slo.max_tokens {
            issues.push(SloIssue::TokensExceeded {
                actual: result.tokens_used,
                cap: contract.slo.max_tokens,
            });
        }
        if result.cost_usd > contract.slo.max_cost_usd {
            issues.push(SloIssue::CostExceeded {
                actual_usd: result.cost_usd,
                cap_usd: contract.slo.max_cost_usd,
            });
        }
        if let Some(required) = contract.slo.min_findings {
            if result.findings.len() < required as usize {
                issues.push(SloIssue::TooFewFindings {
                    found: result.findings.len(),
                    required,
                });
            }
        }
        for finding in &result.findings {
            if !contract.permission_boundary.allows(&finding.tool_name) {
                issues.push(SloIssue::ToolNotAllowed {
                    tool_name: finding.tool_name.clone(),
                });
            }
        }

        let slo_compliance = !issues
            .iter()
            .any(|i| !matches!(i, SloIssue::NotCompleted { .. }));
        let completed = result.status == TaskStatus::Completed;
        let verified = if self.strict {
            completed && issues.is_empty()
        } else {
            completed
        };

        VerificationReport {
            verified,
            slo_compliance,
            issues,
        }
    }
}
