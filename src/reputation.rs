//! Outcome-sourced peer scoring.
//!
//! Every delegated task ends in exactly one recorded outcome per peer;
//! the trust score is derived from the counters on demand, never stored
//! raw. Persistence is a JSONL sidecar: each outcome appends the updated
//! counter snapshot, and the last line per peer wins on reload.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::TaskStatus;

/// Trust prior for peers with no recorded outcomes.
pub const UNKNOWN_PEER_TRUST: f64 = 0.5;

/// Latency at or beyond which the latency factor bottoms out at zero.
const LATENCY_CEILING_MS: f64 = 10_000.0;

#[derive(Debug, Error, Diagnostic)]
pub enum ReputationError {
    #[error("reputation sidecar I/O error")]
    #[diagnostic(code(weavemesh::reputation::io))]
    Io(#[from] std::io::Error),

    #[error("reputation sidecar record is malformed")]
    #[diagnostic(
        code(weavemesh::reputation::corrupt),
        help("Delete or repair the sidecar file; counters rebuild from fresh outcomes.")
    )]
    Corrupt(#[from] serde_json::Error),
}

/// Coarse bucket of a trust score, used to choose graduated authority.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Low,
    Medium,
    High,
    Elite,
}

impl TrustTier {
    /// Monotonic non-decreasing in trust.
    pub fn from_trust(trust: f64) -> Self {
        if trust < 0.4 {
            TrustTier::Low
        } else if trust < 0.7 {
            TrustTier::Medium
        } else if trust < 0.9 {
            TrustTier::High
        } else {
            TrustTier::Elite
        }
    }
}

/// One task outcome as seen by the delegator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutcomeRecord {
    pub status: TaskStatus,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    /// Observed round-trip latency; falls back to the task duration when
    /// the transport did not measure one.
    pub latency_ms: Option<u64>,
}

impl OutcomeRecord {
    pub fn completed(duration_ms: u64) -> Self {
        Self {
            status: TaskStatus::Completed,
            duration_ms,
            tokens_used: 0,
            cost_usd: 0.0,
            latency_ms: None,
        }
    }

    pub fn failed(duration_ms: u64) -> Self {
        Self {
            status: TaskStatus::Failed,
            ..Self::completed(duration_ms)
        }
    }

    #[must_use]
    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }

    fn effective_latency_ms(&self) -> u64 {
        self.latency_ms.unwrap_or(self.duration_ms)
    }
}

/// Per-peer outcome counters. The trust score is always derived.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerReputation {
    pub node_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_aborted: u64,
    pub total_duration_ms: u64,
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,
    pub avg_latency_ms: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

impl PeerReputation {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_aborted: 0,
            total_duration_ms: 0,
            total_tokens_used: 0,
            total_cost_usd: 0.0,
            avg_latency_ms: 0.0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_outcome_at: None,
        }
    }

    fn outcomes(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_aborted
    }

    fn apply(&mut self, outcome: &OutcomeRecord) {
        let prior = self.outcomes() as f64;
        self.avg_latency_ms =
            (self.avg_latency_ms * prior + outcome.effective_latency_ms() as f64) / (prior + 1.0);

        match outcome.status {
            TaskStatus::Completed => {
                self.tasks_completed += 1;
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            TaskStatus::Failed => {
                self.tasks_failed += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
            TaskStatus::Aborted => {
                self.tasks_aborted += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
        }

        self.total_duration_ms += outcome.duration_ms;
        self.total_tokens_used += outcome.tokens_used;
        self.total_cost_usd += outcome.cost_usd;
        self.last_outcome_at = Some(Utc::now());
    }

    /// Derived trust in `[0, 1]`: success rate weighted 0.6, latency 0.2,
    /// plus a capped streak bonus and a capped streak penalty.
    pub fn trust_score(&self) -> f64 {
        let denominator = self.outcomes().max(1) as f64;
        let success_rate = self.tasks_completed as f64 / denominator;
        let streak_bonus = (0.02 * f64::from(self.consecutive_successes)).min(0.2);
        let streak_penalty = (0.05 * f64::from(self.consecutive_failures)).min(0.4);
        let latency_factor = (1.0 - self.avg_latency_ms / LATENCY_CEILING_MS).clamp(0.0, 1.0);

        (0.6 * success_rate + 0.2 * latency_factor + streak_bonus - streak_penalty).clamp(0.0, 1.0)
    }

    pub fn tier(&self) -> TrustTier {
        TrustTier::from_trust(self.trust_score())
    }
}

/// The store of per-peer counters, optionally backed by a JSONL sidecar.
pub struct ReputationStore {
    peers: RwLock<FxHashMap<String, PeerReputation>>,
    sidecar: Option<Mutex<File>>,
}

impl ReputationStore {
    /// Volatile store; counters die with the process.
    pub fn in_memory() -> Self {
        Self {
            peers: RwLock::new(FxHashMap::default()),
            sidecar: None,
        }
    }

    /// Durable store: replays the sidecar (last snapshot per peer wins)
    /// and appends one snapshot per recorded outcome.
    pub fn with_sidecar(path: impl AsRef<Path>) -> Result<Self, ReputationError> {
        let path = path.as_ref();
        let mut peers = FxHashMap::default();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let snapshot: PeerReputation = serde_json::from_str(&line)?;
                peers.insert(snapshot.node_id.clone(), snapshot);
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(peers = peers.len(), path = %path.display(), "reputation sidecar loaded");
        Ok(Self {
            peers: RwLock::new(peers),
            sidecar: Some(Mutex::new(file)),
        })
    }

    /// Fold one outcome into the peer's counters and return the updated
    /// snapshot. Consecutive-failure streaks reset on completion and vice
    /// versa.
    pub fn record_outcome(
        &self,
        node_id: &str,
        outcome: &OutcomeRecord,
    ) -> Result<PeerReputation, ReputationError> {
        let snapshot = {
            let mut peers = self.peers.write();
            let entry = peers
                .entry(node_id.to_string())
                .or_insert_with(|| PeerReputation::new(node_id));
            entry.apply(outcome);
            entry.clone()
        };

        if let Some(sidecar) = &self.sidecar {
            let mut file = sidecar.lock();
            let line = serde_json::to_string(&snapshot)?;
            writeln!(file, "{line}")?;
        }
        Ok(snapshot)
    }

    /// Trust for a peer; unknown peers get the neutral prior of 0.5.
    pub fn trust_score(&self, node_id: &str) -> f64 {
        self.peers
            .read()
            .get(node_id)
            .map_or(UNKNOWN_PEER_TRUST, PeerReputation::trust_score)
    }

    pub fn tier(&self, node_id: &str) -> TrustTier {
        TrustTier::from_trust(self.trust_score(node_id))
    }

    pub fn snapshot(&self, node_id: &str) -> Option<PeerReputation> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<PeerReputation> {
        self.peers.read().values().cloned().collect()
    }
}
