//! Sybil defense at the membership boundary.
//!
//! Joins pass through the detector before a peer can go active. Three
//! indicators fire from a bounded sliding window of recent joins:
//! too many distinct identities joining at once, several identities
//! behind one host, and near-identical capability sets. Optionally a
//! joining peer must solve a SHA-256 proof-of-work challenge first.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::journal::{EventKind, Journal};
use crate::types::NodeIdentity;

/// Hard cap on the join window so an attacker cannot balloon memory.
const MAX_TRACKED_JOINS: usize = 512;

/// Hosts sharing this many identities trigger `SameIpRange`; at
/// [`HOST_CLUSTER_CHALLENGE`] the action escalates to `Challenge`.
const HOST_CLUSTER_FLAG: usize = 3;
const HOST_CLUSTER_CHALLENGE: usize = 5;

/// Capability-set Jaccard similarity at or above this, across at least
/// [`CAPABILITY_CLONE_MIN_NODES`] nodes, triggers `SimilarCapabilities`.
const CAPABILITY_CLONE_SIMILARITY: f64 = 0.9;
const CAPABILITY_CLONE_MIN_NODES: usize = 3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SybilIndicator {
    CoordinatedJoin,
    SameIpRange,
    SimilarCapabilities,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SybilAction {
    Flag,
    Challenge,
    Quarantine,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SybilReport {
    pub indicator: SybilIndicator,
    pub suspect_node_ids: Vec<String>,
    pub confidence: f64,
    pub action: SybilAction,
    pub evidence: serde_json::Value,
}

/// A proof-of-work puzzle: find `solution` such that
/// `SHA-256(challenge ∥ solution)` starts with `difficulty` hex zeros.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PowChallenge {
    pub challenge: String,
    pub difficulty: usize,
}

impl PowChallenge {
    /// A fresh 32-byte random challenge, hex encoded.
    pub fn generate(difficulty: usize) -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            challenge: hex::encode(bytes),
            difficulty,
        }
    }

    pub fn verify(&self, solution: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(self.challenge.as_bytes());
        hasher.update(solution.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest.chars().take(self.difficulty).all(|c| c == '0')
    }

    /// Brute-force a solution by counting. Practical for the small
    /// difficulties membership challenges use.
    pub fn solve(&self) -> String {
        let mut counter: u64 = 0;
        loop {
            let candidate = counter.to_string();
            if self.verify(&candidate) {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[derive(Clone, Debug)]
struct JoinRecord {
    node_id: String,
    host: String,
    capabilities: FxHashSet<String>,
    at: DateTime<Utc>,
}

/// Detection knobs; window size and PoW policy come from the mesh config.
#[derive(Clone, Copy, Debug)]
pub struct SybilPolicy {
    pub max_joins_in_window: usize,
    pub join_window_ms: u64,
    pub pow_difficulty: usize,
    pub require_proof_of_work: bool,
}

impl Default for SybilPolicy {
    fn default() -> Self {
        Self {
            max_joins_in_window: 5,
            join_window_ms: 60_000,
            pow_difficulty: 4,
            require_proof_of_work: false,
        }
    }
}

pub struct SybilDetector {
    policy: SybilPolicy,
    joins: Mutex<VecDeque<JoinRecord>>,
    challenges: Mutex<FxHashMap<String, PowChallenge>>,
    journal: Option<Arc<Journal>>,
}

impl SybilDetector {
    pub fn new(policy: SybilPolicy) -> Self {
        Self {
            policy,
            joins: Mutex::new(VecDeque::new()),
            challenges: Mutex::new(FxHashMap::default()),
            journal: None,
        }
    }

    /// Emit a `sybil_alert` journal event per report.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn requires_proof_of_work(&self) -> bool {
        self.policy.require_proof_of_work
    }

    /// Record a join and return every indicator it tripped.
    pub fn record_join(&self, identity: &NodeIdentity) -> Vec<SybilReport> {
        self.record_join_at(identity, Utc::now())
    }

    pub fn record_join_at(&self, identity: &NodeIdentity, now: DateTime<Utc>) -> Vec<SybilReport> {
        let window = Duration::milliseconds(self.policy.join_window_ms as i64);
        let mut joins = self.joins.lock();

        joins.retain(|j| now - j.at <= window);
        joins.push_back(JoinRecord {
            node_id: identity.node_id.clone(),
            host: identity.api_host().to_string(),
            capabilities: identity.capabilities.iter().cloned().collect(),
            at: now,
        });
        while joins.len() > MAX_TRACKED_JOINS {
            joins.pop_front();
        }

        let mut reports = Vec::new();
        self.check_coordinated_join(&joins, &mut reports);
        self.check_host_cluster(&joins, identity, &mut reports);
        self.check_capability_clones(&joins, identity, &mut reports);
        drop(joins);

        if let Some(journal) = &self.journal {
            for report in &reports {
                journal.try_emit(
                    "mesh",
                    EventKind::SybilAlert,
                    json!({
                        "indicator": report.indicator,
                        "suspect_node_ids": report.suspect_node_ids,
                        "confidence": report.confidence,
                        "action": report.action,
                        "evidence": report.evidence,
                    }),
                );
            }
        }
        reports
    }

    fn check_coordinated_join(&self, joins: &VecDeque<JoinRecord>, reports: &mut Vec<SybilReport>) {
        let distinct: FxHashSet<&str> = joins.iter().map(|j| j.node_id.as_str()).collect();
        if distinct.len() > self.policy.max_joins_in_window {
            let overflow = distinct.len() - self.policy.max_joins_in_window;
            reports.push(SybilReport {
                indicator: SybilIndicator::CoordinatedJoin,
                suspect_node_ids: joins.iter().map(|j| j.node_id.clone()).collect(),
                confidence: (0.5 + 0.1 * overflow as f64).min(1.0),
                action: SybilAction::Flag,
                evidence: json!({
                    "joins_in_window": distinct.len(),
                    "max_joins_in_window": self.policy.max_joins_in_window,
                    "window_ms": self.policy.join_window_ms,
                }),
            });
        }
    }

    fn check_host_cluster(
        &self,
        joins: &VecDeque<JoinRecord>,
        identity: &NodeIdentity,
        reports: &mut Vec<SybilReport>,
    ) {
        let host = identity.api_host();
        let cluster: FxHashSet<&str> = joins
            .iter()
            .filter(|j| j.host == host)
            .map(|j| j.node_id.as_str())
            .collect();
        if cluster.len() >= HOST_CLUSTER_FLAG {
            let action = if cluster.len() >= HOST_CLUSTER_CHALLENGE {
                SybilAction::Challenge
            } else {
                SybilAction::Flag
            };
            reports.push(SybilReport {
                indicator: SybilIndicator::SameIpRange,
                suspect_node_ids: cluster.iter().map(|s| (*s).to_string()).collect(),
                confidence: (cluster.len() as f64 / HOST_CLUSTER_CHALLENGE as f64).min(1.0),
                action,
                evidence: json!({ "host": host, "cluster_size": cluster.len() }),
            });
        }
    }

    fn check_capability_clones(
        &self,
        joins: &VecDeque<JoinRecord>,
        identity: &NodeIdentity,
        reports: &mut Vec<SybilReport>,
    ) {
        let caps: FxHashSet<String> = identity.capabilities.iter().cloned().collect();
        if caps.is_empty() {
            return;
        }
        let mut clones: FxHashSet<&str> = FxHashSet::default();
        let mut similarity_sum = 0.0;
        for join in joins.iter() {
            if join.node_id == identity.node_id {
                continue;
            }
            let similarity = jaccard(&caps, &join.capabilities);
            if similarity >= CAPABILITY_CLONE_SIMILARITY {
                clones.insert(join.node_id.as_str());
                similarity_sum += similarity;
            }
        }
        // The joining node itself counts toward the cluster.
        if clones.len() + 1 >= CAPABILITY_CLONE_MIN_NODES {
            let confidence = similarity_sum / clones.len() as f64;
            let mut suspects: Vec<String> = clones.iter().map(|s| (*s).to_string()).collect();
            suspects.push(identity.node_id.clone());
            reports.push(SybilReport {
                indicator: SybilIndicator::SimilarCapabilities,
                suspect_node_ids: suspects,
                confidence,
                action: SybilAction::Flag,
                evidence: json!({
                    "cluster_size": clones.len() + 1,
                    "similarity_threshold": CAPABILITY_CLONE_SIMILARITY,
                }),
            });
        }
    }

    /// Issue (and remember) a challenge the node must solve before the
    /// mesh lets it go active.
    pub fn issue_challenge(&self, node_id: &str) -> PowChallenge {
        let challenge = PowChallenge::generate(self.policy.pow_difficulty);
        self.challenges
            .lock()
            .insert(node_id.to_string(), challenge.clone());
        challenge
    }

    /// Verify a node's solution against its outstanding challenge,
    /// consuming the challenge on success.
    pub fn verify_solution(&self, node_id: &str, solution: &str) -> bool {
        let mut challenges = self.challenges.lock();
        match challenges.get(node_id) {
            Some(challenge) if challenge.verify(solution) => {
                challenges.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn pending_challenge(&self, node_id: &str) -> Option<PowChallenge> {
        self.challenges.lock().get(node_id).cloned()
    }
}

fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, url: &str, caps: &[&str]) -> NodeIdentity {
        NodeIdentity::new(name, url).with_capabilities(caps.iter().copied())
    }

    #[test]
    fn sixth_distinct_join_in_window_is_coordinated() {
        let detector = SybilDetector::new(SybilPolicy::default());
        let t0 = Utc::now();
        for i in 0..5 {
            let id = identity(&format!("n{i}"), &format!("http://host{i}:1"), &[]);
            assert!(detector.record_join_at(&id, t0).is_empty());
        }
        let sixth = identity("n5", "http://host5:1", &[]);
        let reports = detector.record_join_at(&sixth, t0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].indicator, SybilIndicator::CoordinatedJoin);
        assert!(reports[0].action >= SybilAction::Flag);
    }

    #[test]
    fn joins_outside_window_age_out() {
        let detector = SybilDetector::new(SybilPolicy {
            join_window_ms: 1_000,
            ..SybilPolicy::default()
        });
        let t0 = Utc::now();
        for i in 0..5 {
            let id = identity(&format!("n{i}"), &format!("http://host{i}:1"), &[]);
            detector.record_join_at(&id, t0);
        }
        let later = t0 + Duration::milliseconds(5_000);
        let id = identity("n9", "http://host9:1", &[]);
        assert!(detector.record_join_at(&id, later).is_empty());
    }

    #[test]
    fn host_cluster_flags_then_challenges() {
        let detector = SybilDetector::new(SybilPolicy {
            max_joins_in_window: 50,
            ..SybilPolicy::default()
        });
        let t0 = Utc::now();
        for i in 0..2 {
            let id = identity(&format!("n{i}"), "http://10.0.0.9:80", &[]);
            assert!(detector.record_join_at(&id, t0).is_empty());
        }
        let third = identity("n2", "http://10.0.0.9:80", &[]);
        let reports = detector.record_join_at(&third, t0);
        assert_eq!(reports[0].indicator, SybilIndicator::SameIpRange);
        assert_eq!(reports[0].action, SybilAction::Flag);

        for i in 3..5 {
            let id = identity(&format!("n{i}"), "http://10.0.0.9:80", &[]);
            let reports = detector.record_join_at(&id, t0);
            if i == 4 {
                assert_eq!(reports[0].action, SybilAction::Challenge);
            }
        }
    }

    #[test]
    fn capability_clones_need_three_nodes() {
        let detector = SybilDetector::new(SybilPolicy {
            max_joins_in_window: 50,
            ..SybilPolicy::default()
        });
        let caps = ["read-file", "shell", "browser", "search", "write-file"];
        let t0 = Utc::now();

        let a = identity("a", "http://a:1", &caps);
        let b = identity("b", "http://b:1", &caps);
        assert!(detector.record_join_at(&a, t0).is_empty());
        assert!(detector.record_join_at(&b, t0).is_empty());

        let c = identity("c", "http://c:1", &caps);
        let reports = detector.record_join_at(&c, t0);
        assert_eq!(reports[0].indicator, SybilIndicator::SimilarCapabilities);
        assert_eq!(reports[0].suspect_node_ids.len(), 3);
        assert!(reports[0].confidence >= CAPABILITY_CLONE_SIMILARITY);
    }

    #[test]
    fn pow_verifies_only_matching_solutions() {
        let challenge = PowChallenge::generate(1);
        let solution = challenge.solve();
        assert!(challenge.verify(&solution));

        // Difficulty zero accepts anything.
        let trivial = PowChallenge::generate(0);
        assert!(trivial.verify("whatever"));
    }

    #[test]
    fn issued_challenges_are_consumed_on_success() {
        let detector = SybilDetector::new(SybilPolicy {
            pow_difficulty: 1,
            require_proof_of_work: true,
            ..SybilPolicy::default()
        });
        let challenge = detector.issue_challenge("n1");
        let solution = challenge.solve();

        assert!(!detector.verify_solution("n1", "wrong"));
        assert!(detector.verify_solution("n1", &solution));
        // Consumed: a second verification has no pending challenge.
        assert!(!detector.verify_solution("n1", &solution));
    }
}
