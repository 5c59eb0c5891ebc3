//! Per-result anomaly analysis and peer quarantine.
//!
//! Each delivered result (and each checkpoint of a still-running task)
//! is scored against its contract: cost and duration spikes, tool use
//! outside the permission boundary, tools the peer never advertised, and
//! a sliding-window failure rate. Critical findings quarantine the peer
//! immediately; the pipeline refuses to delegate to quarantined peers.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::checkpoint::TaskCheckpoint;
use crate::contract::DelegationContract;
use crate::journal::{EventKind, Journal};
use crate::types::{SwarmTaskResult, TaskStatus};

/// Minimum recorded outcomes before the failure-rate rule can fire.
const FAILURE_RATE_MIN_OUTCOMES: usize = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    CostSpike,
    DurationSpike,
    SuspiciousFindings,
    CapabilityMismatch,
    RepeatedFailures,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnomalyReport {
    pub anomaly_id: String,
    pub task_id: String,
    pub peer_node_id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub description: String,
    pub evidence: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyReport {
    fn new(
        task_id: &str,
        peer_node_id: &str,
        anomaly_type: AnomalyType,
        severity: Severity,
        description: String,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            anomaly_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            peer_node_id: peer_node_id.to_string(),
            anomaly_type,
            severity,
            description,
            evidence,
            timestamp: Utc::now(),
        }
    }
}

/// Detection thresholds; ratios are relative to the contract's SLO caps.
#[derive(Clone, Copy, Debug)]
pub struct AnomalyThresholds {
    /// Cost ratio at which a spike is `High`; `Critical` at 1.5× this.
    pub cost_spike: f64,
    /// Duration ratio at which a spike is `High`; `Critical` at 2× this.
    pub duration_spike: f64,
    /// Failure rate over the window that triggers `RepeatedFailures`.
    pub failure_rate: f64,
    /// Sliding window of recent outcomes per peer.
    pub failure_window: usize,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            cost_spike: 2.0,
            duration_spike: 2.0,
            failure_rate: 0.4,
            failure_window: 20,
        }
    }
}

pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
    outcomes: Mutex<FxHashMap<String, VecDeque<bool>>>,
    quarantine: Mutex<FxHashSet<String>>,
    journal: Option<Arc<Journal>>,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            thresholds,
            outcomes: Mutex::new(FxHashMap::default()),
            quarantine: Mutex::new(FxHashSet::default()),
            journal: None,
        }
    }

    /// Emit an `anomaly_detected` journal event per report.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Analyze one delivered result. Records the outcome in the peer's
    /// sliding window and returns every report the result triggered.
    pub fn analyze_result(
        &self,
        contract: &DelegationContract,
        result: &SwarmTaskResult,
        peer_capabilities: &BTreeSet<String>,
    ) -> Vec<AnomalyReport> {
        let peer = &result.peer_node_id;
        let mut reports = Vec::new();

        if contract.slo.max_cost_usd > 0.0 {
            let ratio = result.cost_usd / contract.slo.max_cost_usd;
            if let Some(severity) = spike_severity(ratio, self.thresholds.cost_spike, 1.5) {
                reports.push(AnomalyReport::new(
                    &result.task_id,
                    peer,
                    AnomalyType::CostSpike,
                    severity,
                    format!("cost ran {ratio:.1}x over the contract cap"),
                    json!({ "cost_usd": result.cost_usd, "cap_usd": contract.slo.max_cost_usd }),
                ));
            }
        }

        if contract.slo.max_duration_ms > 0 {
            let ratio = result.duration_ms as f64 / contract.slo.max_duration_ms as f64;
            if let Some(severity) = spike_severity(ratio, self.thresholds.duration_spike, 2.0) {
                reports.push(AnomalyReport::new(
                    &result.task_id,
                    peer,
                    AnomalyType::DurationSpike,
                    severity,
                    format!("duration ran {ratio:.1}x over the contract cap"),
                    json!({ "duration_ms": result.duration_ms, "cap_ms": contract.slo.max_duration_ms }),
                ));
            }
        }

        for finding in &result.findings {
            if !contract.permission_boundary.allows(&finding.tool_name) {
                reports.push(AnomalyReport::new(
                    &result.task_id,
                    peer,
                    AnomalyType::SuspiciousFindings,
                    Severity::High,
                    format!("finding used disallowed tool `{}`", finding.tool_name),
                    json!({ "tool_name": finding.tool_name }),
                ));
            } else if !peer_capabilities.is_empty()
                && !peer_capabilities.contains(&finding.tool_name)
            {
                reports.push(AnomalyReport::new(
                    &result.task_id,
                    peer,
                    AnomalyType::CapabilityMismatch,
                    Severity::Medium,
                    format!(
                        "finding used tool `{}` the peer never advertised",
                        finding.tool_name
                    ),
                    json!({ "tool_name": finding.tool_name }),
                ));
            }
        }

        if let Some(report) = self.record_and_check_failures(
            &result.task_id,
            peer,
            result.status != TaskStatus::Completed,
        ) {
            reports.push(report);
        }

        self.settle(&reports);
        reports
    }

    /// Apply the duration rule to a still-running task using the
    /// wall-clock elapsed time carried by its checkpoint.
    pub fn analyze_checkpoint(
        &self,
        contract: &DelegationContract,
        checkpoint: &TaskCheckpoint,
    ) -> Vec<AnomalyReport> {
        let mut reports = Vec::new();
        if contract.slo.max_duration_ms > 0 {
            let ratio = checkpoint.duration_ms as f64 / contract.slo.max_duration_ms as f64;
            if let Some(severity) = spike_severity(ratio, self.thresholds.duration_spike, 2.0) {
                reports.push(AnomalyReport::new(
                    &checkpoint.task_id,
                    &checkpoint.peer_node_id,
                    AnomalyType::DurationSpike,
                    severity,
                    format!("task still running at {ratio:.1}x the contract's duration cap"),
                    json!({
                        "elapsed_ms": checkpoint.duration_ms,
                        "cap_ms": contract.slo.max_duration_ms,
                        "checkpoint_id": checkpoint.checkpoint_id,
                    }),
                ));
            }
        }
        self.settle(&reports);
        reports
    }

    fn record_and_check_failures(
        &self,
        task_id: &str,
        peer: &str,
        failed: bool,
    ) -> Option<AnomalyReport> {
        let mut outcomes = self.outcomes.lock();
        let window = outcomes.entry(peer.to_string()).or_default();
        window.push_back(failed);
        while window.len() > self.thresholds.failure_window {
            window.pop_front();
        }
        if window.len() < FAILURE_RATE_MIN_OUTCOMES {
            return None;
        }
        let failures = window.iter().filter(|f| **f).count();
        let rate = failures as f64 / window.len() as f64;
        if rate < self.thresholds.failure_rate {
            return None;
        }
        let severity = if rate >= 0.8 {
            Severity::Critical
        } else {
            Severity::High
        };
        Some(AnomalyReport::new(
            task_id,
            peer,
            AnomalyType::RepeatedFailures,
            severity,
            format!("peer failed {:.0}% of its recent tasks", rate * 100.0),
            json!({ "failures": failures, "window": window.len(), "rate": rate }),
        ))
    }

    /// Quarantine on critical findings and journal everything.
    fn settle(&self, reports: &[AnomalyReport]) {
        for report in reports {
            if report.severity == Severity::Critical {
                self.quarantine.lock().insert(report.peer_node_id.clone());
            }
            if let Some(journal) = &self.journal {
                journal.try_emit(
                    &report.task_id,
                    EventKind::AnomalyDetected,
                    json!({
                        "anomaly_id": report.anomaly_id,
                        "task_id": report.task_id,
                        "peer_node_id": report.peer_node_id,
                        "anomaly_type": report.anomaly_type,
                        "severity": report.severity,
                        "description": report.description,
                        "evidence": report.evidence,
                    }),
                );
            }
        }
    }

    pub fn is_quarantined(&self, node_id: &str) -> bool {
        self.quarantine.lock().contains(node_id)
    }

    pub fn quarantine(&self, node_id: &str) {
        self.quarantine.lock().insert(node_id.to_string());
    }

    pub fn release(&self, node_id: &str) -> bool {
        self.quarantine.lock().remove(node_id)
    }

    pub fn quarantined(&self) -> Vec<String> {
        self.quarantine.lock().iter().cloned().collect()
    }
}

/// `High` when the ratio exceeds `threshold`, `Critical` beyond
/// `threshold * critical_factor`. `None` below both.
fn spike_severity(ratio: f64, threshold: f64, critical_factor: f64) -> Option<Severity> {
    if ratio > threshold * critical_factor {
        Some(Severity::Critical)
    } else if ratio > threshold {
        Some(Severity::High)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{PermissionBoundary, Slo};
    use crate::types::Finding;

    fn contract() -> DelegationContract {
        DelegationContract::new(
            "a",
            "b",
            "t1",
            "scan the logs",
            Slo {
                max_duration_ms: 1_000,
                max_tokens: 1_000,
                max_cost_usd: 0.10,
                min_findings: None,
            },
            PermissionBoundary::allowing(["read-file"]),
        )
    }

    fn caps() -> BTreeSet<String> {
        ["read-file".to_string()].into_iter().collect()
    }

    #[test]
    fn cost_spike_severities() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());

        // 1.5x: no report.
        let result = SwarmTaskResult::completed("t1", "b").with_usage(0, 0.15, 100);
        assert!(detector
            .analyze_result(&contract(), &result, &caps())
            .is_empty());

        // 2.5x: high.
        let result = SwarmTaskResult::completed("t1", "b").with_usage(0, 0.25, 100);
        let reports = detector.analyze_result(&contract(), &result, &caps());
        assert_eq!(reports[0].anomaly_type, AnomalyType::CostSpike);
        assert_eq!(reports[0].severity, Severity::High);

        // 4x: critical, and the peer lands in quarantine.
        let result = SwarmTaskResult::completed("t1", "b").with_usage(0, 0.40, 100);
        let reports = detector.analyze_result(&contract(), &result, &caps());
        assert_eq!(reports[0].severity, Severity::Critical);
        assert!(detector.is_quarantined("b"));
    }

    #[test]
    fn duration_critical_needs_four_x() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());
        let result = SwarmTaskResult::completed("t1", "b").with_usage(0, 0.0, 3_000);
        let reports = detector.analyze_result(&contract(), &result, &caps());
        assert_eq!(reports[0].severity, Severity::High);

        let result = SwarmTaskResult::completed("t1", "b").with_usage(0, 0.0, 4_500);
        let reports = detector.analyze_result(&contract(), &result, &caps());
        assert_eq!(reports[0].severity, Severity::Critical);
    }

    #[test]
    fn disallowed_and_unadvertised_tools_are_flagged() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());
        let result = SwarmTaskResult::completed("t1", "b").with_findings(vec![
            Finding::new("shell", "ran something"),
            Finding::new("read-file", "read something"),
        ]);
        let reports = detector.analyze_result(&contract(), &result, &caps());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].anomaly_type, AnomalyType::SuspiciousFindings);

        // Allowed by contract but never advertised by the peer.
        let open = DelegationContract::new(
            "a",
            "b",
            "t2",
            "x",
            contract().slo,
            PermissionBoundary::default(),
        );
        let result = SwarmTaskResult::completed("t2", "b")
            .with_findings(vec![Finding::new("browser", "surfed")]);
        let reports = detector.analyze_result(&open, &result, &caps());
        assert_eq!(reports[0].anomaly_type, AnomalyType::CapabilityMismatch);
    }

    #[test]
    fn repeated_failures_reports_after_five_outcomes() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());
        let c = contract();
        for i in 0..4 {
            let result = SwarmTaskResult::failed(format!("t{i}"), "b");
            // Under five outcomes: no failure-rate report yet.
            assert!(detector.analyze_result(&c, &result, &caps()).is_empty());
        }
        let result = SwarmTaskResult::failed("t5", "b");
        let reports = detector.analyze_result(&c, &result, &caps());
        assert_eq!(reports[0].anomaly_type, AnomalyType::RepeatedFailures);
        assert_eq!(reports[0].severity, Severity::Critical);
        assert!(detector.is_quarantined("b"));
    }

    #[test]
    fn manual_quarantine_round_trip() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());
        detector.quarantine("p");
        assert!(detector.is_quarantined("p"));
        assert!(detector.release("p"));
        assert!(!detector.is_quarantined("p"));
    }

    #[test]
    fn checkpoint_duration_rule() {
        let detector = AnomalyDetector::new(AnomalyThresholds::default());
        let checkpoint = TaskCheckpoint::new("t1", "b", json!({})).with_progress(
            Vec::new(),
            0,
            0.0,
            2_500,
        );
        let reports = detector.analyze_checkpoint(&contract(), &checkpoint);
        assert_eq!(reports[0].anomaly_type, AnomalyType::DurationSpike);
        assert_eq!(reports[0].severity, Severity::High);
    }
}
