//! Re-delegation chains: who has already tried a task, how many hops
//! deep the retries are, and whether another attempt is permitted yet.
//!
//! Cooldowns are measured from the previous *attempt* (request time), so
//! a hung peer cannot extend the lockout by never answering.

use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RedelegationError {
    /// The cooldown since the last attempt has not elapsed.
    #[error("re-delegation for task {task_id} is cooling down for another {remaining_ms} ms")]
    #[diagnostic(code(weavemesh::redelegation::cooldown))]
    CooldownActive { task_id: String, remaining_ms: i64 },

    /// The chain used up its retry budget and is terminal.
    #[error("task {task_id} exhausted its {max} re-delegations")]
    #[diagnostic(
        code(weavemesh::redelegation::exhausted),
        help("Give up on the task or restart it under a new task id with fresh attributes.")
    )]
    ChainExhausted { task_id: String, max: u32 },
}

/// One delegation attempt in a chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DelegationHop {
    pub node_id: String,
    pub at: DateTime<Utc>,
}

/// The retry history of one task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DelegationChain {
    pub task_id: String,
    pub hops: Vec<DelegationHop>,
    pub terminal: bool,
}

impl DelegationChain {
    /// Retries after the first attempt.
    pub fn redelegations(&self) -> u32 {
        (self.hops.len().saturating_sub(1)) as u32
    }

    /// Peers that already attempted this task; the router should avoid
    /// handing a retry back to one of them.
    pub fn attempted_nodes(&self) -> Vec<&str> {
        self.hops.iter().map(|h| h.node_id.as_str()).collect()
    }
}

/// Tracks per-task chains and enforces the hop cap plus cooldown.
pub struct RedelegationMonitor {
    max_redelegations: u32,
    cooldown: Duration,
    chains: Mutex<FxHashMap<String, DelegationChain>>,
}

impl RedelegationMonitor {
    pub fn new(max_redelegations: u32, cooldown_ms: u64) -> Self {
        Self {
            max_redelegations,
            cooldown: Duration::milliseconds(cooldown_ms as i64),
            chains: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record a delegation attempt, returning the hop index (0 for the
    /// first attempt). Subsequent attempts must respect the cooldown and
    /// the retry budget; a chain that exhausts its budget is terminal.
    pub fn track_delegation(&self, task_id: &str, node_id: &str) -> Result<u32, RedelegationError> {
        self.track_delegation_at(task_id, node_id, Utc::now())
    }

    pub fn track_delegation_at(
        &self,
        task_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, RedelegationError> {
        let mut chains = self.chains.lock();
        let chain = chains
            .entry(task_id.to_string())
            .or_insert_with(|| DelegationChain {
                task_id: task_id.to_string(),
                hops: Vec::new(),
                terminal: false,
            });

        if chain.terminal {
            return Err(RedelegationError::ChainExhausted {
                task_id: task_id.to_string(),
                max: self.max_redelegations,
            });
        }

        if let Some(last) = chain.hops.last() {
            let since = now - last.at;
            if since < self.cooldown {
                return Err(RedelegationError::CooldownActive {
                    task_id: task_id.to_string(),
                    remaining_ms: (self.cooldown - since).num_milliseconds(),
                });
            }
            if chain.redelegations() >= self.max_redelegations {
                chain.terminal = true;
                return Err(RedelegationError::ChainExhausted {
                    task_id: task_id.to_string(),
                    max: self.max_redelegations,
                });
            }
        }

        chain.hops.push(DelegationHop {
            node_id: node_id.to_string(),
            at: now,
        });
        Ok(chain.redelegations())
    }

    pub fn chain(&self, task_id: &str) -> Option<DelegationChain> {
        self.chains.lock().get(task_id).cloned()
    }

    /// Drop a finished task's chain.
    pub fn clear(&self, task_id: &str) {
        self.chains.lock().remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_budget_is_enforced() {
        let monitor = RedelegationMonitor::new(2, 0);
        let t0 = Utc::now();
        assert_eq!(monitor.track_delegation_at("t", "a", t0).unwrap(), 0);
        let t1 = t0 + Duration::milliseconds(10);
        assert_eq!(monitor.track_delegation_at("t", "b", t1).unwrap(), 1);
        let t2 = t1 + Duration::milliseconds(10);
        assert_eq!(monitor.track_delegation_at("t", "c", t2).unwrap(), 2);

        let t3 = t2 + Duration::milliseconds(10);
        assert!(matches!(
            monitor.track_delegation_at("t", "d", t3),
            Err(RedelegationError::ChainExhausted { max: 2, .. })
        ));
        assert!(monitor.chain("t").unwrap().terminal);
    }

    #[test]
    fn cooldown_blocks_rapid_retries() {
        let monitor = RedelegationMonitor::new(3, 1_000);
        let t0 = Utc::now();
        monitor.track_delegation_at("t", "a", t0).unwrap();

        let too_soon = t0 + Duration::milliseconds(200);
        assert!(matches!(
            monitor.track_delegation_at("t", "b", too_soon),
            Err(RedelegationError::CooldownActive { .. })
        ));

        let later = t0 + Duration::milliseconds(1_200);
        assert_eq!(monitor.track_delegation_at("t", "b", later).unwrap(), 1);
    }

    #[test]
    fn attempted_nodes_lists_every_hop() {
        let monitor = RedelegationMonitor::new(3, 0);
        let t0 = Utc::now();
        monitor.track_delegation_at("t", "a", t0).unwrap();
        monitor
            .track_delegation_at("t", "b", t0 + Duration::milliseconds(5))
            .unwrap();
        assert_eq!(monitor.chain("t").unwrap().attempted_nodes(), vec!["a", "b"]);
    }
}
