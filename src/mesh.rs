//! Mesh membership: identity, the peer table, heartbeats, and the peer
//! lifecycle state machine.
//!
//! ```text
//! unknown     → active       on join / heartbeat
//! active      → suspected    no heartbeat for suspected_after_ms
//! suspected   → unreachable  no heartbeat for unreachable_after_ms
//! unreachable → (evicted)    no heartbeat for evict_after_ms
//! any         → left         on explicit leave
//! any         → active       on any successful heartbeat
//! ```
//!
//! The sweeper advances states purely from `last_heartbeat_at`, so the
//! FSM is testable without timers. Joins pass through the sybil detector
//! first; a `challenge` outcome withholds the peer from `active` until
//! its proof-of-work solution verifies.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::journal::{EventKind, Journal};
use crate::sybil::{PowChallenge, SybilAction, SybilDetector, SybilReport};
use crate::transport::client::PeerClient;
use crate::types::NodeIdentity;

/// Session id membership events are journaled under.
pub const MESH_SESSION: &str = "mesh";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Suspected,
    Unreachable,
    Left,
}

/// One row of the peer table. Exclusively owned by the mesh manager;
/// everything else holds a `node_id` and looks up.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    pub identity: NodeIdentity,
    pub status: PeerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub joined_at: DateTime<Utc>,
}

/// What the join gate decided.
#[derive(Clone, Debug, PartialEq)]
pub enum JoinOutcome {
    /// Peer is active immediately.
    Active {
        reports: Vec<SybilReport>,
    },
    /// Peer is held out of `active` until it solves the challenge.
    ChallengeRequired {
        challenge: PowChallenge,
        reports: Vec<SybilReport>,
    },
}

/// Peer FSM timers, lifted out of [`MeshConfig`].
#[derive(Clone, Copy, Debug)]
pub struct MeshTimers {
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub suspected_after: Duration,
    pub unreachable_after: Duration,
    pub evict_after: Duration,
}

impl From<&MeshConfig> for MeshTimers {
    fn from(config: &MeshConfig) -> Self {
        let ms = |v: u64| Duration::milliseconds(v as i64);
        Self {
            heartbeat_interval: ms(config.heartbeat_interval_ms),
            sweep_interval: ms(config.sweep_interval_ms),
            suspected_after: ms(config.suspected_after_ms),
            unreachable_after: ms(config.unreachable_after_ms),
            evict_after: ms(config.evict_after_ms),
        }
    }
}

pub struct MeshManager {
    identity: NodeIdentity,
    timers: MeshTimers,
    peers: RwLock<FxHashMap<String, PeerEntry>>,
    /// Peers withheld from `active` until their PoW verifies.
    pending_pow: Mutex<FxHashSet<String>>,
    sybil: Arc<SybilDetector>,
    journal: Option<Arc<Journal>>,
}

impl MeshManager {
    pub fn new(identity: NodeIdentity, timers: MeshTimers, sybil: Arc<SybilDetector>) -> Self {
        Self {
            identity,
            timers,
            peers: RwLock::new(FxHashMap::default()),
            pending_pow: Mutex::new(FxHashSet::default()),
            sybil,
            journal: None,
        }
    }

    /// Journal membership changes under [`MESH_SESSION`].
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Admit (or refresh) a peer. The join runs through the sybil
    /// detector; any `Challenge` verdict — or a blanket proof-of-work
    /// requirement — parks the peer in `suspected` until it solves the
    /// puzzle.
    pub fn handle_join(&self, identity: NodeIdentity) -> JoinOutcome {
        self.handle_join_at(identity, Utc::now())
    }

    pub fn handle_join_at(&self, identity: NodeIdentity, now: DateTime<Utc>) -> JoinOutcome {
        let reports = self.sybil.record_join_at(&identity, now);
        let must_challenge = self.sybil.requires_proof_of_work()
            || reports.iter().any(|r| r.action >= SybilAction::Challenge);

        let node_id = identity.node_id.clone();
        let status = if must_challenge {
            self.pending_pow.lock().insert(node_id.clone());
            PeerStatus::Suspected
        } else {
            PeerStatus::Active
        };

        {
            let mut peers = self.peers.write();
            let entry = peers.entry(node_id.clone()).or_insert_with(|| PeerEntry {
                identity: identity.clone(),
                status,
                last_heartbeat_at: now,
                last_latency_ms: None,
                consecutive_failures: 0,
                joined_at: now,
            });
            entry.identity = identity.clone();
            entry.status = status;
            entry.last_heartbeat_at = now;
        }

        if let Some(journal) = &self.journal {
            journal.try_emit(
                MESH_SESSION,
                EventKind::PeerJoined,
                json!({
                    "node_id": node_id,
                    "api_url": identity.api_url,
                    "challenged": must_challenge,
                }),
            );
        }

        if must_challenge {
            let challenge = self.sybil.issue_challenge(&node_id);
            info!(%node_id, "peer join held pending proof-of-work");
            JoinOutcome::ChallengeRequired { challenge, reports }
        } else {
            debug!(%node_id, "peer joined");
            JoinOutcome::Active { reports }
        }
    }

    /// Verify a held peer's proof-of-work solution; success promotes it
    /// to `active`.
    pub fn verify_join_pow(&self, node_id: &str, solution: &str) -> bool {
        if !self.sybil.verify_solution(node_id, solution) {
            warn!(node_id, "proof-of-work solution rejected");
            return false;
        }
        self.pending_pow.lock().remove(node_id);
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.status = PeerStatus::Active;
        }
        info!(node_id, "proof-of-work verified, peer active");
        true
    }

    /// Refresh a peer on an inbound heartbeat. Any successful heartbeat
    /// reactivates the peer unless it still owes a proof-of-work.
    pub fn handle_heartbeat(&self, identity: NodeIdentity, latency_ms: Option<u64>) {
        self.handle_heartbeat_at(identity, latency_ms, Utc::now());
    }

    pub fn handle_heartbeat_at(
        &self,
        identity: NodeIdentity,
        latency_ms: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let withheld = self.pending_pow.lock().contains(&identity.node_id);
        let mut peers = self.peers.write();
        let entry = peers
            .entry(identity.node_id.clone())
            .or_insert_with(|| PeerEntry {
                identity: identity.clone(),
                status: PeerStatus::Suspected,
                last_heartbeat_at: now,
                last_latency_ms: None,
                consecutive_failures: 0,
                joined_at: now,
            });
        entry.identity = identity;
        entry.last_heartbeat_at = now;
        if let Some(latency) = latency_ms {
            entry.last_latency_ms = Some(latency);
        }
        entry.consecutive_failures = 0;
        if !withheld {
            entry.status = PeerStatus::Active;
        }
    }

    /// A transport exchange with the peer failed.
    pub fn record_failure(&self, node_id: &str) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.consecutive_failures += 1;
        }
    }

    /// A transport exchange succeeded; resets the failure streak.
    pub fn record_success(&self, node_id: &str, latency_ms: Option<u64>) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.consecutive_failures = 0;
            if let Some(latency) = latency_ms {
                entry.last_latency_ms = Some(latency);
            }
        }
    }

    /// Explicit departure.
    pub fn handle_leave(&self, node_id: &str) {
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.status = PeerStatus::Left;
        }
        drop(peers);
        if let Some(journal) = &self.journal {
            journal.try_emit(
                MESH_SESSION,
                EventKind::PeerLeft,
                json!({ "node_id": node_id }),
            );
        }
    }

    /// Advance every peer's state purely from `last_heartbeat_at`.
    /// Returns the node ids evicted this pass.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut peers = self.peers.write();
        peers.retain(|node_id, entry| {
            if entry.status == PeerStatus::Left {
                return true;
            }
            let silence = now - entry.last_heartbeat_at;
            if silence >= self.timers.evict_after {
                evicted.push(node_id.clone());
                return false;
            }
            if silence >= self.timers.unreachable_after {
                entry.status = PeerStatus::Unreachable;
            } else if silence >= self.timers.suspected_after && entry.status == PeerStatus::Active {
                entry.status = PeerStatus::Suspected;
            }
            true
        });
        drop(peers);
        for node_id in &evicted {
            self.pending_pow.lock().remove(node_id);
            debug!(%node_id, "peer evicted");
            if let Some(journal) = &self.journal {
                journal.try_emit(
                    MESH_SESSION,
                    EventKind::PeerLeft,
                    json!({ "node_id": node_id, "evicted": true }),
                );
            }
        }
        evicted
    }

    pub fn get_peers(&self) -> Vec<PeerEntry> {
        self.peers.read().values().cloned().collect()
    }

    pub fn get_active_peers(&self) -> Vec<PeerEntry> {
        self.peers
            .read()
            .values()
            .filter(|p| p.status == PeerStatus::Active)
            .cloned()
            .collect()
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerEntry> {
        self.peers.read().get(node_id).cloned()
    }

    /// Spawn the heartbeat and sweeper loops. Both stop when the handle
    /// shuts down (or is dropped).
    pub fn run(self: &Arc<Self>, client: Arc<dyn PeerClient>) -> MeshHandle {
        let (sweep_shutdown_tx, mut sweep_shutdown_rx) = oneshot::channel::<()>();
        let (hb_shutdown_tx, mut hb_shutdown_rx) = oneshot::channel::<()>();

        let mesh = Arc::clone(self);
        let sweeper = tokio::spawn(async move {
            let period = mesh
                .timers
                .sweep_interval
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(2));
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = &mut sweep_shutdown_rx => break,
                    _ = ticker.tick() => {
                        mesh.sweep();
                    }
                }
            }
        });

        let mesh = Arc::clone(self);
        let heartbeater = tokio::spawn(async move {
            let period = mesh
                .timers
                .heartbeat_interval
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(5));
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = &mut hb_shutdown_rx => break,
                    _ = ticker.tick() => {
                        mesh.heartbeat_pass(client.as_ref()).await;
                    }
                }
            }
        });

        MeshHandle {
            shutdowns: vec![sweep_shutdown_tx, hb_shutdown_tx],
            tasks: vec![sweeper, heartbeater],
        }
    }

    /// One heartbeat fan-out to every non-left peer.
    async fn heartbeat_pass(&self, client: &dyn PeerClient) {
        let targets: Vec<(String, String)> = {
            self.peers
                .read()
                .values()
                .filter(|p| p.status != PeerStatus::Left)
                .map(|p| (p.identity.node_id.clone(), p.identity.api_url.clone()))
                .collect()
        };
        for (node_id, api_url) in targets {
            match client.heartbeat(&api_url, self.identity.clone()).await {
                Ok(latency_ms) => {
                    let withheld = self.pending_pow.lock().contains(&node_id);
                    let mut peers = self.peers.write();
                    if let Some(entry) = peers.get_mut(&node_id) {
                        entry.last_heartbeat_at = Utc::now();
                        entry.last_latency_ms = Some(latency_ms);
                        entry.consecutive_failures = 0;
                        if !withheld {
                            entry.status = PeerStatus::Active;
                        }
                    }
                }
                Err(err) => {
                    debug!(%node_id, error = %err, "heartbeat failed");
                    self.record_failure(&node_id);
                }
            }
        }
    }
}

/// Running mesh loops; shutting down stops heartbeat and sweeper.
pub struct MeshHandle {
    shutdowns: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshHandle {
    pub async fn shutdown(mut self) {
        for tx in self.shutdowns.drain(..) {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for MeshHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
