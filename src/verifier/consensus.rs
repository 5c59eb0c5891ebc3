//! Round-based agreement between independent result verifiers.
//!
//! A round collects one vote per voter on a task's result hash. When the
//! vote count reaches the round's quorum the round evaluates itself: it
//! agrees when the plurality hash carries at least the required share of
//! votes. Rounds are ephemeral; they do not survive a restart.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::SwarmTaskResult;

#[derive(Debug, Error, Diagnostic)]
pub enum ConsensusError {
    #[error("no consensus round exists for task {task_id}")]
    #[diagnostic(code(weavemesh::consensus::unknown_round))]
    UnknownRound { task_id: String },

    #[error("consensus round for task {task_id} already exists")]
    #[diagnostic(code(weavemesh::consensus::duplicate_round))]
    DuplicateRound { task_id: String },

    #[error("consensus round for task {task_id} has already evaluated")]
    #[diagnostic(
        code(weavemesh::consensus::already_evaluated),
        help("Create a new round to re-verify; evaluated rounds are immutable.")
    )]
    AlreadyEvaluated { task_id: String },
}

/// One verifier's vote on a result hash.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub voter_node_id: String,
    pub result_hash: String,
    pub confidence: f64,
}

/// The verdict of an evaluated round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsensusOutcome {
    pub agreed: bool,
    pub majority_hash: Option<String>,
    pub majority_count: usize,
    pub agreement_ratio: f64,
    pub dissenting_node_ids: Vec<String>,
}

/// A single task's verification round.
#[derive(Clone, Debug)]
pub struct ConsensusRound {
    pub task_id: String,
    pub required_voters: usize,
    pub required_agreement: f64,
    votes: Vec<Vote>,
    outcome: Option<ConsensusOutcome>,
}

impl ConsensusRound {
    fn new(task_id: String, required_voters: usize, required_agreement: f64) -> Self {
        Self {
            task_id,
            required_voters: required_voters.max(1),
            required_agreement: required_agreement.clamp(0.0, 1.0),
            votes: Vec::new(),
            outcome: None,
        }
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn outcome(&self) -> Option<&ConsensusOutcome> {
        self.outcome.as_ref()
    }

    /// A later vote from the same voter replaces the earlier one.
    fn push_vote(&mut self, vote: Vote) {
        if let Some(existing) = self
            .votes
            .iter_mut()
            .find(|v| v.voter_node_id == vote.voter_node_id)
        {
            *existing = vote;
        } else {
            self.votes.push(vote);
        }
    }

    fn evaluate(&mut self) -> ConsensusOutcome {
        let mut tally: FxHashMap<&str, usize> = FxHashMap::default();
        for vote in &self.votes {
            *tally.entry(vote.result_hash.as_str()).or_default() += 1;
        }
        // Plurality; ties break toward the lexicographically smaller hash
        // so evaluation is deterministic.
        let majority = tally
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(hash, count)| ((*hash).to_string(), *count));

        let (majority_hash, majority_count) = match majority {
            Some((hash, count)) => (Some(hash), count),
            None => (None, 0),
        };
        let agreement_ratio = if self.votes.is_empty() {
            0.0
        } else {
            majority_count as f64 / self.votes.len() as f64
        };
        let dissenting_node_ids = self
            .votes
            .iter()
            .filter(|v| Some(&v.result_hash) != majority_hash.as_ref())
            .map(|v| v.voter_node_id.clone())
            .collect();

        let outcome = ConsensusOutcome {
            agreed: agreement_ratio >= self.required_agreement && majority_count > 0,
            majority_hash,
            majority_count,
            agreement_ratio,
            dissenting_node_ids,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Keeper of in-flight rounds, keyed by task id.
pub struct ConsensusVerifier {
    default_voters: usize,
    default_agreement: f64,
    rounds: Mutex<FxHashMap<String, ConsensusRound>>,
}

impl ConsensusVerifier {
    pub fn new(default_voters: usize, default_agreement: f64) -> Self {
        Self {
            default_voters: default_voters.max(1),
            default_agreement: default_agreement.clamp(0.0, 1.0),
            rounds: Mutex::new(FxHashMap::default()),
        }
    }

    /// Open a round with explicit quorum parameters.
    pub fn create_round(
        &self,
        task_id: &str,
        required_voters: usize,
        required_agreement: f64,
    ) -> Result<(), ConsensusError> {
        let mut rounds = self.rounds.lock();
        if rounds.contains_key(task_id) {
            return Err(ConsensusError::DuplicateRound {
                task_id: task_id.to_string(),
            });
        }
        rounds.insert(
            task_id.to_string(),
            ConsensusRound::new(task_id.to_string(), required_voters, required_agreement),
        );
        Ok(())
    }

    /// Open a round with the configured defaults.
    pub fn create_default_round(&self, task_id: &str) -> Result<(), ConsensusError> {
        self.create_round(task_id, self.default_voters, self.default_agreement)
    }

    /// Record a vote. When the quorum is reached the round auto-evaluates
    /// and the outcome is returned; before that, `Ok(None)`.
    pub fn submit_verification(
        &self,
        task_id: &str,
        voter_node_id: &str,
        result_hash: impl Into<String>,
        confidence: f64,
    ) -> Result<Option<ConsensusOutcome>, ConsensusError> {
        let mut rounds = self.rounds.lock();
        let round = rounds
            .get_mut(task_id)
            .ok_or_else(|| ConsensusError::UnknownRound {
                task_id: task_id.to_string(),
            })?;
        if round.outcome.is_some() {
            return Err(ConsensusError::AlreadyEvaluated {
                task_id: task_id.to_string(),
            });
        }

        round.push_vote(Vote {
            voter_node_id: voter_node_id.to_string(),
            result_hash: result_hash.into(),
            confidence: confidence.clamp(0.0, 1.0),
        });

        if round.votes.len() >= round.required_voters {
            Ok(Some(round.evaluate()))
        } else {
            Ok(None)
        }
    }

    pub fn round(&self, task_id: &str) -> Option<ConsensusRound> {
        self.rounds.lock().get(task_id).cloned()
    }

    /// Drop a terminal round.
    pub fn close_round(&self, task_id: &str) {
        self.rounds.lock().remove(task_id);
    }
}

/// Canonical hash of a result, for voters to agree on.
pub fn result_hash(result: &SwarmTaskResult) -> String {
    let mut hasher = Sha256::new();
    hasher.update(result.task_id.as_bytes());
    hasher.update([result.status as u8]);
    for finding in &result.findings {
        hasher.update(finding.tool_name.as_bytes());
        hasher.update(finding.summary.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanimous_round_agrees() {
        let verifier = ConsensusVerifier::new(2, 0.67);
        verifier.create_default_round("t1").unwrap();

        assert!(verifier
            .submit_verification("t1", "a", "h1", 0.95)
            .unwrap()
            .is_none());
        let outcome = verifier
            .submit_verification("t1", "b", "h1", 0.90)
            .unwrap()
            .expect("quorum reached");

        assert!(outcome.agreed);
        assert_eq!(outcome.majority_count, 2);
        assert!(outcome.dissenting_node_ids.is_empty());
    }

    #[test]
    fn split_round_dissents() {
        let verifier = ConsensusVerifier::new(3, 0.67);
        verifier.create_round("t1", 3, 0.67).unwrap();
        verifier.submit_verification("t1", "a", "h1", 0.9).unwrap();
        verifier.submit_verification("t1", "b", "h1", 0.9).unwrap();
        let outcome = verifier
            .submit_verification("t1", "c", "h2", 0.9)
            .unwrap()
            .unwrap();

        assert!(outcome.agreed);
        assert_eq!(outcome.majority_hash.as_deref(), Some("h1"));
        assert_eq!(outcome.dissenting_node_ids, vec!["c".to_string()]);
        assert!((outcome.agreement_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_voter_replaces_vote() {
        let verifier = ConsensusVerifier::new(2, 1.0);
        verifier.create_default_round("t1").unwrap();
        verifier.submit_verification("t1", "a", "h1", 0.5).unwrap();
        // Same voter changes its mind; still only one vote in the round.
        assert!(verifier
            .submit_verification("t1", "a", "h2", 0.8)
            .unwrap()
            .is_none());

        let outcome = verifier
            .submit_verification("t1", "b", "h2", 0.8)
            .unwrap()
            .unwrap();
        assert!(outcome.agreed);
        assert_eq!(outcome.majority_hash.as_deref(), Some("h2"));
    }

    #[test]
    fn evaluated_rounds_are_immutable() {
        let verifier = ConsensusVerifier::new(1, 1.0);
        verifier.create_default_round("t1").unwrap();
        verifier.submit_verification("t1", "a", "h1", 1.0).unwrap();

        assert!(matches!(
            verifier.submit_verification("t1", "b", "h1", 1.0),
            Err(ConsensusError::AlreadyEvaluated { .. })
        ));
    }
}
