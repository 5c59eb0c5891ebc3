//! Journal event record and the hash chain over it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Closed set of event kinds the core emits.
///
/// The journal stores the string form; unknown strings round-trip through
/// [`EventKind::Custom`] so events from external collaborators (planner,
/// tool runtime, plugins) survive untouched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    DelegationCreated,
    TaskDispatched,
    TaskResult,
    SloViolation,
    EscrowDeposit,
    BondHeld,
    BondReleased,
    BondSlashed,
    ReputationUpdated,
    AnomalyDetected,
    AuctionCreated,
    BidReceived,
    AuctionAwarded,
    CheckpointSaved,
    RootCauseIdentified,
    ConsensusEvaluated,
    PeerJoined,
    PeerLeft,
    SybilAlert,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::DelegationCreated => "delegation_created",
            EventKind::TaskDispatched => "task_dispatched",
            EventKind::TaskResult => "task_result",
            EventKind::SloViolation => "slo_violation",
            EventKind::EscrowDeposit => "escrow_deposit",
            EventKind::BondHeld => "bond_held",
            EventKind::BondReleased => "bond_released",
            EventKind::BondSlashed => "bond_slashed",
            EventKind::ReputationUpdated => "reputation_updated",
            EventKind::AnomalyDetected => "anomaly_detected",
            EventKind::AuctionCreated => "auction_created",
            EventKind::BidReceived => "bid_received",
            EventKind::AuctionAwarded => "auction_awarded",
            EventKind::CheckpointSaved => "checkpoint_saved",
            EventKind::RootCauseIdentified => "root_cause_identified",
            EventKind::ConsensusEvaluated => "consensus_evaluated",
            EventKind::PeerJoined => "peer_joined",
            EventKind::PeerLeft => "peer_left",
            EventKind::SybilAlert => "sybil_alert",
            EventKind::Custom(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "delegation_created" => EventKind::DelegationCreated,
            "task_dispatched" => EventKind::TaskDispatched,
            "task_result" => EventKind::TaskResult,
            "slo_violation" => EventKind::SloViolation,
            "escrow_deposit" => EventKind::EscrowDeposit,
            "bond_held" => EventKind::BondHeld,
            "bond_released" => EventKind::BondReleased,
            "bond_slashed" => EventKind::BondSlashed,
            "reputation_updated" => EventKind::ReputationUpdated,
            "anomaly_detected" => EventKind::AnomalyDetected,
            "auction_created" => EventKind::AuctionCreated,
            "bid_received" => EventKind::BidReceived,
            "auction_awarded" => EventKind::AuctionAwarded,
            "checkpoint_saved" => EventKind::CheckpointSaved,
            "root_cause_identified" => EventKind::RootCauseIdentified,
            "consensus_evaluated" => EventKind::ConsensusEvaluated,
            "peer_joined" => EventKind::PeerJoined,
            "peer_left" => EventKind::PeerLeft,
            "sybil_alert" => EventKind::SybilAlert,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from(s.as_str()))
    }
}

/// One record in the append-only journal. Immutable once emitted.
///
/// `hash_prev` is absent on the first record of a file and otherwise holds
/// the SHA-256 (hex) of the previous record's persisted line. Field order
/// here is the canonical serialization order; do not reorder.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JournalEvent {
    pub event_id: String,
    pub session_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash_prev: Option<String>,
}

impl JournalEvent {
    pub(crate) fn next(
        session_id: impl Into<String>,
        seq: u64,
        kind: EventKind,
        payload: serde_json::Value,
        hash_prev: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            seq,
            timestamp: Utc::now(),
            kind,
            payload,
            hash_prev,
        }
    }

    /// The canonical one-line serialization that is persisted and hashed.
    pub fn canonical_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// SHA-256 over a persisted line, hex encoded. The next record's
/// `hash_prev` must equal this value.
pub fn chain_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            EventKind::TaskResult,
            EventKind::BondSlashed,
            EventKind::Custom("planner_step".into()),
        ] {
            assert_eq!(EventKind::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn canonical_line_omits_absent_hash_prev() {
        let ev = JournalEvent::next("s", 0, EventKind::PeerJoined, json!({}), None);
        let line = ev.canonical_line().unwrap();
        assert!(!line.contains("hash_prev"));

        let ev = JournalEvent::next("s", 1, EventKind::PeerLeft, json!({}), Some("ab".into()));
        assert!(ev.canonical_line().unwrap().contains("\"hash_prev\":\"ab\""));
    }

    #[test]
    fn chain_hash_is_stable_for_identical_lines() {
        let ev = JournalEvent::next("s", 0, EventKind::PeerJoined, json!({"a": 1}), None);
        let line = ev.canonical_line().unwrap();
        assert_eq!(chain_hash(&line), chain_hash(&line));

        let parsed: JournalEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.canonical_line().unwrap(), line);
    }
}
