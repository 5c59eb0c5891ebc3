//! Result verification: per-contract SLO checks and multi-voter
//! consensus rounds.

pub mod consensus;
pub mod outcome;

pub use consensus::{ConsensusError, ConsensusOutcome, ConsensusRound, ConsensusVerifier, result_hash};
pub use outcome::{OutcomeVerifier, SloIssue, VerificationReport};
