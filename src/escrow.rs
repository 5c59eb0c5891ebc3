//! Escrowed bonds backing delegations.
//!
//! A peer deposits funds into its account; each delegation holds a bond
//! out of the free balance for the task's duration. Success releases the
//! bond; an SLO violation or timeout slashes a configured fraction into a
//! sink. Slashed amounts never flow to a counterparty.
//!
//! Every state change is journaled under the `escrow` session, and
//! [`EscrowManager::restore`] rebuilds the balances by replaying those
//! events after a restart.

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::journal::{EventKind, Journal, JournalError};

/// Session id escrow events are journaled under.
pub const ESCROW_SESSION: &str = "escrow";

#[derive(Debug, Error, Diagnostic)]
pub enum EscrowError {
    /// Bond amount is below the configured minimum.
    #[error("bond of ${requested:.4} is below the minimum ${min:.4}")]
    #[diagnostic(code(weavemesh::escrow::below_minimum))]
    BelowMinimum { requested: f64, min: f64 },

    /// The account's free balance cannot cover the bond.
    #[error("insufficient free balance: requested ${requested:.4}, available ${available:.4}")]
    #[diagnostic(
        code(weavemesh::escrow::insufficient),
        help("Deposit more funds for this node or lower the bond amount.")
    )]
    InsufficientFunds { requested: f64, available: f64 },

    /// A bond is already held for this task.
    #[error("task {task_id} already has an active bond")]
    #[diagnostic(code(weavemesh::escrow::duplicate_hold))]
    DuplicateHold { task_id: String },

    /// Deposit or bond amount is not a positive finite number.
    #[error("amount ${amount} is not a positive finite value")]
    #[diagnostic(code(weavemesh::escrow::bad_amount))]
    BadAmount { amount: f64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Journal(#[from] JournalError),
}

/// One peer's balances. `free_balance + Σ held` never goes negative.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EscrowAccount {
    pub node_id: String,
    pub free_balance: f64,
    pub held: FxHashMap<String, f64>,
}

impl EscrowAccount {
    fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            free_balance: 0.0,
            held: FxHashMap::default(),
        }
    }

    pub fn held_total(&self) -> f64 {
        self.held.values().sum()
    }
}

/// What a slash did to the held bond.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlashReceipt {
    /// Amount moved to the sink.
    pub slashed: f64,
    /// Remainder returned to the peer's free balance.
    pub returned: f64,
}

struct EscrowState {
    accounts: FxHashMap<String, EscrowAccount>,
    /// task_id → node_id for active holds. At most one hold per task.
    holds: FxHashMap<String, String>,
    slashed_sink: f64,
}

/// Balances, per-task holds, and the slash sink.
pub struct EscrowManager {
    min_bond_usd: f64,
    state: Mutex<EscrowState>,
    journal: Option<Arc<Journal>>,
}

impl EscrowManager {
    pub fn new(min_bond_usd: f64) -> Self {
        Self {
            min_bond_usd,
            state: Mutex::new(EscrowState {
                accounts: FxHashMap::default(),
                holds: FxHashMap::default(),
                slashed_sink: 0.0,
            }),
            journal: None,
        }
    }

    /// Journal every state change under [`ESCROW_SESSION`].
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Rebuild balances by replaying escrow events from the journal, then
    /// keep journaling onto it.
    pub fn restore(min_bond_usd: f64, journal: Arc<Journal>) -> Result<Self, EscrowError> {
        let manager = Self::new(min_bond_usd);
        let mut replayed = 0usize;
        for event in journal.iter_all()? {
            let event = event?;
            let p = &event.payload;
            let node = p["node_id"].as_str().unwrap_or_default().to_string();
            let task = p["task_id"].as_str().unwrap_or_default().to_string();
            let amount = p["amount"].as_f64().unwrap_or(0.0);
            let mut state = manager.state.lock();
            match event.kind {
                EventKind::EscrowDeposit => {
                    state
                        .accounts
                        .entry(node.clone())
                        .or_insert_with(|| EscrowAccount::new(&node))
                        .free_balance += amount;
                    replayed += 1;
                }
                EventKind::BondHeld => {
                    if let Some(account) = state.accounts.get_mut(&node) {
                        account.free_balance -= amount;
                        account.held.insert(task.clone(), amount);
                    }
                    state.holds.insert(task, node);
                    replayed += 1;
                }
                EventKind::BondReleased => {
                    if let Some(node) = state.holds.remove(&task) {
                        if let Some(account) = state.accounts.get_mut(&node) {
                            if let Some(held) = account.held.remove(&task) {
                                account.free_balance += held;
                            }
                        }
                    }
                    replayed += 1;
                }
                EventKind::BondSlashed => {
                    let slashed = p["slashed"].as_f64().unwrap_or(0.0);
                    let returned = p["returned"].as_f64().unwrap_or(0.0);
                    if let Some(node) = state.holds.remove(&task) {
                        if let Some(account) = state.accounts.get_mut(&node) {
                            account.held.remove(&task);
                            account.free_balance += returned;
                        }
                    }
                    state.slashed_sink += slashed;
                    replayed += 1;
                }
                _ => {}
            }
        }
        debug!(replayed, "escrow state restored from journal");
        Ok(Self {
            journal: Some(journal),
            ..manager
        })
    }

    fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            journal.try_emit(ESCROW_SESSION, kind, payload);
        }
    }

    /// Grow a peer's free balance.
    pub fn deposit(&self, node_id: &str, amount: f64) -> Result<f64, EscrowError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EscrowError::BadAmount { amount });
        }
        let new_free = {
            let mut state = self.state.lock();
            let account = state
                .accounts
                .entry(node_id.to_string())
                .or_insert_with(|| EscrowAccount::new(node_id));
            account.free_balance += amount;
            account.free_balance
        };
        self.emit(
            EventKind::EscrowDeposit,
            json!({ "node_id": node_id, "amount": amount }),
        );
        Ok(new_free)
    }

    /// Move `amount` from the peer's free balance into a hold for `task_id`.
    ///
    /// Rejects when the amount is under the configured minimum bond, the
    /// free balance cannot cover it, or the task already holds a bond.
    pub fn hold_bond(&self, task_id: &str, node_id: &str, amount: f64) -> Result<(), EscrowError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EscrowError::BadAmount { amount });
        }
        if amount < self.min_bond_usd {
            return Err(EscrowError::BelowMinimum {
                requested: amount,
                min: self.min_bond_usd,
            });
        }
        {
            let mut state = self.state.lock();
            if state.holds.contains_key(task_id) {
                return Err(EscrowError::DuplicateHold {
                    task_id: task_id.to_string(),
                });
            }
            let account = state
                .accounts
                .entry(node_id.to_string())
                .or_insert_with(|| EscrowAccount::new(node_id));
            if account.free_balance < amount {
                return Err(EscrowError::InsufficientFunds {
                    requested: amount,
                    available: account.free_balance,
                });
            }
            account.free_balance -= amount;
            account.held.insert(task_id.to_string(), amount);
            state.holds.insert(task_id.to_string(), node_id.to_string());
        }
        self.emit(
            EventKind::BondHeld,
            json!({ "task_id": task_id, "node_id": node_id, "amount": amount }),
        );
        Ok(())
    }

    /// Return the held bond to the peer's free balance. Idempotent: a
    /// task with no active hold releases zero.
    pub fn release_bond(&self, task_id: &str) -> Result<f64, EscrowError> {
        let released = {
            let mut state = self.state.lock();
            match state.holds.remove(task_id) {
                None => return Ok(0.0),
                Some(node_id) => {
                    let account = state
                        .accounts
                        .get_mut(&node_id)
                        .expect("hold entry implies account");
                    let held = account.held.remove(task_id).unwrap_or(0.0);
                    account.free_balance += held;
                    (node_id, held)
                }
            }
        };
        self.emit(
            EventKind::BondReleased,
            json!({ "task_id": task_id, "node_id": released.0, "amount": released.1 }),
        );
        Ok(released.1)
    }

    /// Transfer `pct` of the held bond to the sink and return the rest to
    /// the peer. Idempotent: a task with no active hold slashes zero.
    pub fn slash_bond(&self, task_id: &str, pct: f64) -> Result<SlashReceipt, EscrowError> {
        let pct = pct.clamp(0.0, 1.0);
        let (node_id, receipt) = {
            let mut state = self.state.lock();
            match state.holds.remove(task_id) {
                None => {
                    return Ok(SlashReceipt {
                        slashed: 0.0,
                        returned: 0.0,
                    });
                }
                Some(node_id) => {
                    let account = state
                        .accounts
                        .get_mut(&node_id)
                        .expect("hold entry implies account");
                    let held = account.held.remove(task_id).unwrap_or(0.0);
                    let slashed = held * pct;
                    let returned = held - slashed;
                    account.free_balance += returned;
                    state.slashed_sink += slashed;
                    (node_id, SlashReceipt { slashed, returned })
                }
            }
        };
        self.emit(
            EventKind::BondSlashed,
            json!({
                "task_id": task_id,
                "node_id": node_id,
                "slashed": receipt.slashed,
                "returned": receipt.returned,
                "pct": pct,
            }),
        );
        Ok(receipt)
    }

    pub fn free_balance(&self, node_id: &str) -> f64 {
        self.state
            .lock()
            .accounts
            .get(node_id)
            .map_or(0.0, |a| a.free_balance)
    }

    pub fn held_total(&self, node_id: &str) -> f64 {
        self.state
            .lock()
            .accounts
            .get(node_id)
            .map_or(0.0, EscrowAccount::held_total)
    }

    /// Cumulative amount slashed into the sink.
    pub fn slashed_sink(&self) -> f64 {
        self.state.lock().slashed_sink
    }

    pub fn account(&self, node_id: &str) -> Option<EscrowAccount> {
        self.state.lock().accounts.get(node_id).cloned()
    }
}
