//! Core orchestration: the pipeline that turns "delegate this subtask"
//! into a guarded, bonded, verified exchange with a peer.
//!
//! One delegation flows route → friction → firebreak → graduated
//! authority → bond hold → dispatch → (remote execution) → result
//! delivery → outcome verification → anomaly analysis → consensus →
//! escrow settlement → reputation update → optional re-delegation →
//! checkpoint finalization. Every stage reads and writes an explicit
//! per-delegation record; there are no module-level singletons, and the
//! [`CoreServices`] aggregate is constructed once at process start.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::anomaly::{AnomalyDetector, AnomalyReport, AnomalyThresholds};
use crate::auction::TaskAuction;
use crate::behavior::BehavioralScorer;
use crate::checkpoint::{CheckpointError, CheckpointStore, TaskCheckpoint};
use crate::config::MeshConfig;
use crate::contract::{DelegationContract, PermissionBoundary, Slo};
use crate::decompose::{Decomposition, SubTask, TaskDecomposer};
use crate::escrow::{EscrowError, EscrowManager};
use crate::firebreak::{FirebreakAction, FirebreakDecision, LiabilityFirebreak};
use crate::friction::{CognitiveFrictionEngine, FrictionAdvice, FrictionContext};
use crate::journal::{EventKind, Journal, JournalError};
use crate::mesh::{MeshHandle, MeshManager, MeshTimers, PeerEntry};
use crate::redelegation::{RedelegationError, RedelegationMonitor};
use crate::reputation::{OutcomeRecord, ReputationError, ReputationStore};
use crate::rootcause::RootCauseAnalyzer;
use crate::router::{DelegateeRouter, RoutingDecision};
use crate::sybil::{SybilDetector, SybilPolicy};
use crate::transport::client::{DispatchMode, HttpPeerClient, PeerClient, TransportError};
use crate::transport::server::SwarmHandlers;
use crate::transport::wire::{BidAck, BidEnvelope, TaskDecision, TaskRequestEnvelope, new_request_id};
use crate::types::{
    Bid, DelegationTarget, NodeIdentity, Rfq, SwarmTaskRequest, SwarmTaskResult, TaskConstraints,
    TaskStatus,
};
use crate::verifier::{ConsensusVerifier, OutcomeVerifier, VerificationReport, result_hash};

/// Failures recorded in the last ten minutes feed the friction context.
const RECENT_FAILURE_WINDOW: Duration = Duration::minutes(10);

#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reputation(#[from] ReputationError),
}

/// Why a delegation did not dispatch.
#[derive(Debug, Error, Diagnostic)]
pub enum DelegateError {
    /// The router sent this subtask to a human.
    #[error("subtask is routed to a human: {reasons:?}")]
    #[diagnostic(code(weavemesh::pipeline::human_required))]
    HumanRequired { reasons: Vec<String> },

    /// The firebreak blocked dispatch outright.
    #[error("firebreak blocked dispatch: {reason}")]
    #[diagnostic(code(weavemesh::pipeline::blocked))]
    Blocked { reason: String },

    /// The firebreak demands explicit confirmation first.
    #[error("dispatch requires confirmation: {reason}")]
    #[diagnostic(
        code(weavemesh::pipeline::confirmation),
        help("Re-invoke with `confirmed = true` once a human has signed off.")
    )]
    ConfirmationRequired { reason: String },

    /// No peers were eligible (all quarantined, left, or already tried).
    #[error("no eligible peers for delegation")]
    #[diagnostic(code(weavemesh::pipeline::no_peers))]
    NoPeers,

    /// The auction closed without an awardable bid.
    #[error("auction {rfq_id} closed without a winner")]
    #[diagnostic(code(weavemesh::pipeline::no_winner))]
    NoWinner { rfq_id: String },

    /// The worker refused the dispatch.
    #[error("peer {node_id} rejected the task: {reason}")]
    #[diagnostic(code(weavemesh::pipeline::rejected))]
    Rejected { node_id: String, reason: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bond(#[from] EscrowError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Redelegation(#[from] RedelegationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// A delegation currently in flight from this node.
#[derive(Clone, Debug)]
pub struct ActiveDelegation {
    pub session_id: String,
    pub contract: DelegationContract,
    pub peer: PeerEntry,
    pub routing: RoutingDecision,
    pub friction: FrictionAdvice,
    pub firebreak: FirebreakDecision,
    pub bond_usd: f64,
    pub dispatched_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// What settling a result concluded.
#[derive(Clone, Debug)]
pub struct SettleReport {
    pub task_id: String,
    pub verification: VerificationReport,
    pub anomalies: Vec<AnomalyReport>,
    pub slashed_usd: f64,
    pub released_usd: f64,
    /// True when the caller may retry through the re-delegation monitor.
    pub redelegation_allowed: bool,
}

/// The aggregate of every safety component, wired at process start.
pub struct CoreServices {
    pub config: MeshConfig,
    pub journal: Arc<Journal>,
    pub reputation: Arc<ReputationStore>,
    pub escrow: Arc<EscrowManager>,
    pub checkpoints: Arc<CheckpointStore>,
    pub consensus: Arc<ConsensusVerifier>,
    pub anomaly: Arc<AnomalyDetector>,
    pub behavior: Arc<BehavioralScorer>,
    pub redelegation: Arc<RedelegationMonitor>,
    pub sybil: Arc<SybilDetector>,
    pub mesh: Arc<MeshManager>,
    pub auction: Arc<TaskAuction>,
    pub rootcause: RootCauseAnalyzer,
    pub outcome_verifier: OutcomeVerifier,
    pub friction: CognitiveFrictionEngine,
    pub firebreak: LiabilityFirebreak,
    pub router: DelegateeRouter,
    pub decomposer: TaskDecomposer,
    pub client: Arc<dyn PeerClient>,

    outstanding: Mutex<FxHashMap<String, ActiveDelegation>>,
    recent_failures: Mutex<VecDeque<DateTime<Utc>>>,

    // Inbound work for the embedding planner: tasks this node agreed to
    // execute and RFQs it may bid on.
    task_inbox_tx: flume::Sender<SwarmTaskRequest>,
    task_inbox_rx: Mutex<Option<flume::Receiver<SwarmTaskRequest>>>,
    rfq_inbox_tx: flume::Sender<Rfq>,
    rfq_inbox_rx: Mutex<Option<flume::Receiver<Rfq>>>,
}

/// Builder for [`CoreServices`]; lifecycle equals process lifetime.
pub struct CoreBuilder {
    config: MeshConfig,
    identity: NodeIdentity,
    client: Option<Arc<dyn PeerClient>>,
    checkpoint_path: PathBuf,
    reputation_sidecar: Option<PathBuf>,
}

impl CoreBuilder {
    pub fn new(config: MeshConfig, identity: NodeIdentity) -> Self {
        Self {
            config,
            identity,
            client: None,
            checkpoint_path: PathBuf::from("checkpoints/checkpoints.jsonl"),
            reputation_sidecar: None,
        }
    }

    /// Swap the HTTP client out, e.g. for a scripted one in tests.
    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn PeerClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    #[must_use]
    pub fn with_reputation_sidecar(mut self, path: impl Into<PathBuf>) -> Self {
        self.reputation_sidecar = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Arc<CoreServices>, CoreError> {
        let config = self.config;
        let journal = Arc::new(Journal::open(config.journal.clone())?);
        let client: Arc<dyn PeerClient> = self
            .client
            .unwrap_or_else(|| Arc::new(HttpPeerClient::new()));

        let reputation = Arc::new(match &self.reputation_sidecar {
            Some(path) => ReputationStore::with_sidecar(path)?,
            None => ReputationStore::in_memory(),
        });
        let escrow = Arc::new(EscrowManager::restore(
            config.min_bond_usd,
            Arc::clone(&journal),
        )?);
        let checkpoints = Arc::new(
            CheckpointStore::open(self.checkpoint_path)?.with_journal(Arc::clone(&journal)),
        );
        let sybil = Arc::new(
            SybilDetector::new(SybilPolicy {
                max_joins_in_window: config.max_joins_in_window,
                join_window_ms: config.join_window_ms,
                pow_difficulty: config.pow_difficulty,
                require_proof_of_work: config.require_proof_of_work,
            })
            .with_journal(Arc::clone(&journal)),
        );
        let mesh = Arc::new(
            MeshManager::new(
                self.identity.clone(),
                MeshTimers::from(&config),
                Arc::clone(&sybil),
            )
            .with_journal(Arc::clone(&journal)),
        );
        let auction = Arc::new(
            TaskAuction::new(
                self.identity,
                config.default_bid_deadline_ms,
                config.min_bids_to_award,
                Arc::clone(&reputation),
                Arc::clone(&client),
            )
            .with_journal(Arc::clone(&journal)),
        );
        let anomaly = Arc::new(
            AnomalyDetector::new(AnomalyThresholds {
                cost_spike: config.cost_spike_threshold,
                duration_spike: config.duration_spike_threshold,
                failure_rate: config.failure_rate_threshold,
                failure_window: config.failure_rate_window,
            })
            .with_journal(Arc::clone(&journal)),
        );

        let (task_inbox_tx, task_inbox_rx) = flume::unbounded();
        let (rfq_inbox_tx, rfq_inbox_rx) = flume::unbounded();

        Ok(Arc::new(CoreServices {
            consensus: Arc::new(ConsensusVerifier::new(
                config.required_voters,
                config.required_agreement,
            )),
            behavior: Arc::new(BehavioralScorer::new()),
            redelegation: Arc::new(RedelegationMonitor::new(
                config.max_redelegations,
                config.redelegation_cooldown_ms,
            )),
            rootcause: RootCauseAnalyzer::new().with_journal(Arc::clone(&journal)),
            outcome_verifier: OutcomeVerifier::new(config.slo_strict),
            friction: CognitiveFrictionEngine::new(),
            firebreak: LiabilityFirebreak::default(),
            router: DelegateeRouter::new(),
            decomposer: TaskDecomposer::new(config.complexity_floor_words, config.max_sub_tasks),
            journal,
            reputation,
            escrow,
            checkpoints,
            sybil,
            mesh,
            auction,
            anomaly,
            client,
            config,
            outstanding: Mutex::new(FxHashMap::default()),
            recent_failures: Mutex::new(VecDeque::new()),
            task_inbox_tx,
            task_inbox_rx: Mutex::new(Some(task_inbox_rx)),
            rfq_inbox_tx,
            rfq_inbox_rx: Mutex::new(Some(rfq_inbox_rx)),
        }))
    }
}

impl CoreServices {
    /// Split a task into delegatable subtasks (or decline to).
    pub fn plan(&self, task_text: &str, constraints: &TaskConstraints) -> Decomposition {
        let peers = self.eligible_peers(&[]);
        self.decomposer
            .decompose(task_text, peers.len(), constraints)
    }

    /// Active peers minus quarantined ones and explicit exclusions.
    pub fn eligible_peers(&self, exclude: &[&str]) -> Vec<PeerEntry> {
        self.mesh
            .get_active_peers()
            .into_iter()
            .filter(|p| !self.anomaly.is_quarantined(&p.identity.node_id))
            .filter(|p| !exclude.contains(&p.identity.node_id.as_str()))
            .collect()
    }

    /// Delegate one subtask end to end: gates, auction, authority, bond,
    /// dispatch. Returns the in-flight record on success.
    ///
    /// `confirmed` asserts that a human has signed off, which satisfies a
    /// `RequireConfirmation` firebreak verdict.
    #[instrument(skip(self, sub_task), fields(session_id = %session_id, sub_task_id = %sub_task.sub_task_id))]
    pub async fn delegate(
        &self,
        session_id: &str,
        sub_task: &SubTask,
        mode: DispatchMode,
        confirmed: bool,
    ) -> Result<ActiveDelegation, DelegateError> {
        let attrs = &sub_task.attributes;

        // Routing: humans are outside the mesh.
        let routing = self.router.route(attrs);
        if routing.target == DelegationTarget::Human {
            return Err(DelegateError::HumanRequired {
                reasons: routing.reasons,
            });
        }

        // Hop accounting happens before any network work so exhausted
        // chains fail fast.
        let already_tried: Vec<String> = self
            .redelegation
            .chain(&sub_task.sub_task_id)
            .map(|c| c.attempted_nodes().iter().map(|s| (*s).to_string()).collect())
            .unwrap_or_default();
        let exclude: Vec<&str> = already_tried.iter().map(String::as_str).collect();

        let peers = self.eligible_peers(&exclude);
        if peers.is_empty() {
            return Err(DelegateError::NoPeers);
        }

        // Advisory friction, then the binding firebreak.
        let outstanding = self.outstanding.lock().len();
        let friction = self.friction.assess(
            attrs,
            &FrictionContext {
                outstanding_delegations: outstanding,
                peer_trust: best_trust(&peers, &self.reputation),
                recent_failures: self.recent_failure_count(),
            },
        );
        let firebreak = self.firebreak.evaluate(attrs, outstanding);
        match firebreak.action {
            FirebreakAction::Block => {
                self.journal.try_emit(
                    session_id,
                    EventKind::Custom("dispatch_blocked".into()),
                    json!({ "task_id": sub_task.sub_task_id, "reason": firebreak.reason }),
                );
                return Err(DelegateError::Blocked {
                    reason: firebreak.reason,
                });
            }
            FirebreakAction::RequireConfirmation if !confirmed => {
                return Err(DelegateError::ConfirmationRequired {
                    reason: firebreak.reason,
                });
            }
            _ => {}
        }

        // Auction the subtask to the eligible peers.
        let rfq = self
            .auction
            .create_auction(
                session_id,
                &sub_task.text,
                sub_task.constraints.clone(),
                sub_task.constraints.tool_allowlist.iter().cloned(),
                &peers,
            )
            .await;
        let award = self.auction.award_auction(&rfq.rfq_id).await;
        let winning_bid = award.winning_bid.ok_or(DelegateError::NoWinner {
            rfq_id: rfq.rfq_id.clone(),
        })?;
        let peer = peers
            .iter()
            .find(|p| p.identity.node_id == winning_bid.bidder_node_id)
            .cloned()
            .ok_or(DelegateError::NoPeers)?;

        self.dispatch(session_id, sub_task, peer, routing, friction, firebreak, mode)
            .await
    }

    /// Skip the auction and hand the subtask to a chosen peer. The
    /// explicit peer choice overrides routing, but the friction and
    /// firebreak gates and all settlement rules still apply.
    pub async fn delegate_to(
        &self,
        session_id: &str,
        sub_task: &SubTask,
        peer: PeerEntry,
        mode: DispatchMode,
        confirmed: bool,
    ) -> Result<ActiveDelegation, DelegateError> {
        let routing = self.router.route(&sub_task.attributes);
        let outstanding = self.outstanding.lock().len();
        let friction = self.friction.assess(
            &sub_task.attributes,
            &FrictionContext {
                outstanding_delegations: outstanding,
                peer_trust: self.reputation.trust_score(&peer.identity.node_id),
                recent_failures: self.recent_failure_count(),
            },
        );
        let firebreak = self.firebreak.evaluate(&sub_task.attributes, outstanding);
        match firebreak.action {
            FirebreakAction::Block => {
                return Err(DelegateError::Blocked {
                    reason: firebreak.reason,
                });
            }
            FirebreakAction::RequireConfirmation if !confirmed => {
                return Err(DelegateError::ConfirmationRequired {
                    reason: firebreak.reason,
                });
            }
            _ => {}
        }
        self.dispatch(session_id, sub_task, peer, routing, friction, firebreak, mode)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        session_id: &str,
        sub_task: &SubTask,
        peer: PeerEntry,
        routing: RoutingDecision,
        friction: FrictionAdvice,
        firebreak: FirebreakDecision,
        mode: DispatchMode,
    ) -> Result<ActiveDelegation, DelegateError> {
        let task_id = sub_task.sub_task_id.clone();
        let node_id = peer.identity.node_id.clone();

        self.redelegation.track_delegation(&task_id, &node_id)?;

        // Graduated authority from the peer's trust tier.
        let tier = self.reputation.tier(&node_id);
        let contract = DelegationContract::new(
            self.mesh.identity().node_id.clone(),
            node_id.clone(),
            task_id.clone(),
            sub_task.text.clone(),
            Slo::from(&sub_task.constraints),
            PermissionBoundary {
                tool_allowlist: sub_task.constraints.tool_allowlist.clone(),
            },
        )
        .for_tier(tier);

        // Bond before dispatch; a peer that cannot post one does not work.
        let bond_usd = self
            .config
            .min_bond_usd
            .max(contract.slo.max_cost_usd * 0.1);
        if let Err(err) = self.escrow.hold_bond(&task_id, &node_id, bond_usd) {
            self.journal.try_emit(
                session_id,
                EventKind::Custom("bond_rejected".into()),
                json!({ "task_id": task_id, "node_id": node_id, "error": err.to_string() }),
            );
            return Err(err.into());
        }

        self.journal.try_emit(
            session_id,
            EventKind::DelegationCreated,
            json!({
                "task_id": task_id,
                "contract_id": contract.contract_id,
                "delegatee": node_id,
                "tier": tier,
                "slo": contract.slo,
                "monitoring": contract.monitoring,
                "routing": routing.target,
                "friction": friction.level,
                "bond_usd": bond_usd,
            }),
        );

        let request = SwarmTaskRequest {
            task_id: task_id.clone(),
            session_id: session_id.to_string(),
            task_text: sub_task.text.clone(),
            constraints: sub_task.constraints.clone(),
            originator: self.mesh.identity().clone(),
        };
        let envelope = TaskRequestEnvelope {
            request_id: new_request_id(),
            originator_node_id: self.mesh.identity().node_id.clone(),
            request,
        };

        let decision = match self
            .client
            .send_task(&peer.identity.api_url, envelope, mode)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                // No work was started; the bond comes straight back.
                let _ = self.escrow.release_bond(&task_id);
                self.mesh.record_failure(&node_id);
                return Err(err.into());
            }
        };
        if !decision.accepted {
            let _ = self.escrow.release_bond(&task_id);
            return Err(DelegateError::Rejected {
                node_id,
                reason: decision
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        let dispatched_at = Utc::now();
        let outer_deadline_ms = contract
            .slo
            .max_duration_ms
            .max(mode.deadline().as_millis() as u64)
            .max(self.config.delegation_timeout_ms);
        let active = ActiveDelegation {
            session_id: session_id.to_string(),
            contract,
            peer,
            routing,
            friction,
            firebreak,
            bond_usd,
            dispatched_at,
            deadline: dispatched_at + Duration::milliseconds(outer_deadline_ms as i64),
        };

        self.journal.try_emit(
            session_id,
            EventKind::TaskDispatched,
            json!({
                "task_id": task_id,
                "node_id": active.peer.identity.node_id,
                "deadline": active.deadline,
            }),
        );
        self.outstanding.lock().insert(task_id, active.clone());
        info!(
            task_id = %active.contract.task_id,
            peer = %active.peer.identity.node_id,
            "delegation dispatched"
        );
        Ok(active)
    }

    /// Settle a delivered result: verify, scan for anomalies, vote,
    /// release or slash the bond, and update reputation.
    #[instrument(skip(self, result), fields(task_id = %result.task_id))]
    pub fn settle_result(&self, result: &SwarmTaskResult) -> Option<SettleReport> {
        let active = {
            let mut outstanding = self.outstanding.lock();
            let active = outstanding.remove(&result.task_id)?;
            // Only the contracted delegatee may settle its task.
            if active.peer.identity.node_id != result.peer_node_id {
                warn!(
                    task_id = %result.task_id,
                    reporter = %result.peer_node_id,
                    delegatee = %active.peer.identity.node_id,
                    "result from a non-delegatee peer ignored"
                );
                outstanding.insert(result.task_id.clone(), active);
                return None;
            }
            active
        };
        let task_id = result.task_id.clone();
        let session_id = active.session_id.clone();
        let mut contract = active.contract.clone();

        self.journal.try_emit(
            &session_id,
            EventKind::TaskResult,
            json!({
                "task_id": task_id,
                "node_id": result.peer_node_id,
                "status": result.status,
                "duration_ms": result.duration_ms,
                "tokens_used": result.tokens_used,
                "cost_usd": result.cost_usd,
            }),
        );

        let verification = self.outcome_verifier.verify(&contract, result);
        let anomalies =
            self.anomaly
                .analyze_result(&contract, result, &active.peer.identity.capabilities);

        // The local node always votes in the task's consensus round.
        let _ = self.consensus.create_default_round(&task_id);
        let confidence = if verification.verified { 0.9 } else { 0.3 };
        if let Ok(Some(outcome)) = self.consensus.submit_verification(
            &task_id,
            &self.mesh.identity().node_id,
            result_hash(result),
            confidence,
        ) {
            self.journal.try_emit(
                &session_id,
                EventKind::ConsensusEvaluated,
                json!({
                    "task_id": task_id,
                    "agreed": outcome.agreed,
                    "majority_count": outcome.majority_count,
                    "agreement_ratio": outcome.agreement_ratio,
                    "dissenting_node_ids": outcome.dissenting_node_ids,
                }),
            );
        }

        let (slashed_usd, released_usd) = if verification.verified {
            contract.mark_completed();
            let released = self.escrow.release_bond(&task_id).unwrap_or(0.0);
            (0.0, released)
        } else {
            contract.mark_violated();
            self.journal.try_emit(
                &session_id,
                EventKind::SloViolation,
                json!({
                    "task_id": task_id,
                    "node_id": result.peer_node_id,
                    "issues": verification.issues,
                }),
            );
            let receipt = self
                .escrow
                .slash_bond(&task_id, self.config.slash_pct_on_violation)
                .unwrap_or(crate::escrow::SlashReceipt {
                    slashed: 0.0,
                    returned: 0.0,
                });
            self.note_failure();
            (receipt.slashed, receipt.returned)
        };

        let outcome = OutcomeRecord {
            status: if verification.verified {
                TaskStatus::Completed
            } else if result.status == TaskStatus::Aborted {
                TaskStatus::Aborted
            } else {
                TaskStatus::Failed
            },
            duration_ms: result.duration_ms,
            tokens_used: result.tokens_used,
            cost_usd: result.cost_usd,
            latency_ms: active.peer.last_latency_ms,
        };
        if let Ok(snapshot) = self.reputation.record_outcome(&result.peer_node_id, &outcome) {
            self.journal.try_emit(
                &session_id,
                EventKind::ReputationUpdated,
                json!({
                    "task_id": task_id,
                    "node_id": snapshot.node_id,
                    "trust": snapshot.trust_score(),
                    "tier": snapshot.tier(),
                }),
            );
        }

        if !verification.verified {
            let window = self
                .journal
                .read_session(&session_id, crate::journal::ReadOptions::default())
                .unwrap_or_default();
            self.rootcause.analyze(
                &task_id,
                &window,
                self.reputation.snapshot(&result.peer_node_id).as_ref(),
            );
        } else {
            let _ = self.checkpoints.finalize(&task_id);
            self.redelegation.clear(&task_id);
        }

        let redelegation_allowed = !verification.verified
            && self
                .redelegation
                .chain(&task_id)
                .is_none_or(|c| !c.terminal);

        Some(SettleReport {
            task_id,
            verification,
            anomalies,
            slashed_usd,
            released_usd,
            redelegation_allowed,
        })
    }

    /// Expire overdue delegations: mark violated, slash per the timeout
    /// policy, and record a failed outcome. Returns the expired task ids.
    pub fn check_timeouts(&self) -> Vec<String> {
        self.check_timeouts_at(Utc::now())
    }

    pub fn check_timeouts_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let overdue: Vec<ActiveDelegation> = {
            let mut outstanding = self.outstanding.lock();
            let expired: Vec<String> = outstanding
                .iter()
                .filter(|(_, a)| now > a.deadline)
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| outstanding.remove(id))
                .collect()
        };

        let mut expired_ids = Vec::with_capacity(overdue.len());
        for mut active in overdue {
            let task_id = active.contract.task_id.clone();
            let node_id = active.peer.identity.node_id.clone();
            warn!(%task_id, peer = %node_id, "delegation deadline expired");
            active.contract.mark_violated();

            self.journal.try_emit(
                &active.session_id,
                EventKind::SloViolation,
                json!({
                    "task_id": task_id,
                    "node_id": node_id,
                    "issues": [{ "issue": "duration_exceeded", "timeout": true }],
                }),
            );
            let _ = self
                .escrow
                .slash_bond(&task_id, self.config.slash_pct_on_timeout);

            let elapsed_ms = (now - active.dispatched_at).num_milliseconds().max(0) as u64;
            let _ = self.reputation.record_outcome(
                &node_id,
                &OutcomeRecord::failed(elapsed_ms),
            );
            self.note_failure();
            expired_ids.push(task_id);
        }
        expired_ids
    }

    /// Record an inbound checkpoint and run the still-running duration
    /// rule against its contract.
    pub fn accept_checkpoint(&self, checkpoint: TaskCheckpoint) -> Result<(), CoreError> {
        let contract = self
            .outstanding
            .lock()
            .get(&checkpoint.task_id)
            .map(|a| a.contract.clone());
        if let Some(contract) = contract {
            self.anomaly.analyze_checkpoint(&contract, &checkpoint);
        }
        self.checkpoints.save(checkpoint)?;
        Ok(())
    }

    /// Abort an in-flight delegation without fault: the contract is
    /// cancelled, the bond returns in full, and an aborted outcome is
    /// recorded. The worker learns of the abort on its next checkpoint
    /// ack. Consensus rounds already evaluated are left untouched.
    pub fn abort_delegation(&self, task_id: &str) -> bool {
        let Some(mut active) = self.outstanding.lock().remove(task_id) else {
            return false;
        };
        active.contract.mark_cancelled();
        let _ = self.escrow.release_bond(task_id);
        let elapsed_ms = (Utc::now() - active.dispatched_at).num_milliseconds().max(0) as u64;
        let _ = self.reputation.record_outcome(
            &active.peer.identity.node_id,
            &OutcomeRecord {
                status: TaskStatus::Aborted,
                duration_ms: elapsed_ms,
                tokens_used: 0,
                cost_usd: 0.0,
                latency_ms: active.peer.last_latency_ms,
            },
        );
        self.journal.try_emit(
            &active.session_id,
            EventKind::Custom("delegation_aborted".into()),
            json!({ "task_id": task_id, "node_id": active.peer.identity.node_id }),
        );
        true
    }

    /// Delegations currently in flight.
    pub fn outstanding(&self) -> Vec<ActiveDelegation> {
        self.outstanding.lock().values().cloned().collect()
    }

    /// Spawn the mesh loops plus a timeout watchdog.
    pub fn start(self: &Arc<Self>) -> CoreHandle {
        let mesh_handle = self.mesh.run(Arc::clone(&self.client));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let core = Arc::clone(self);
        let watchdog = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        core.check_timeouts();
                        core.auction.cleanup();
                    }
                }
            }
        });
        CoreHandle {
            mesh: Some(mesh_handle),
            watchdog: Some(watchdog),
            shutdown: Some(shutdown_tx),
        }
    }

    fn note_failure(&self) {
        let mut failures = self.recent_failures.lock();
        let now = Utc::now();
        failures.push_back(now);
        while failures
            .front()
            .is_some_and(|at| now - *at > RECENT_FAILURE_WINDOW)
        {
            failures.pop_front();
        }
    }

    fn recent_failure_count(&self) -> usize {
        let now = Utc::now();
        self.recent_failures
            .lock()
            .iter()
            .filter(|at| now - **at <= RECENT_FAILURE_WINDOW)
            .count()
    }
}

impl CoreServices {
    /// Take the receiver of inbound task requests this node accepted.
    /// The embedding planner drains it; callable once.
    pub fn take_task_inbox(&self) -> Option<flume::Receiver<SwarmTaskRequest>> {
        self.task_inbox_rx.lock().take()
    }

    /// Take the receiver of inbound RFQs this node may bid on.
    pub fn take_rfq_inbox(&self) -> Option<flume::Receiver<Rfq>> {
        self.rfq_inbox_rx.lock().take()
    }

    /// Send a bid for a peer's RFQ back to its originator.
    pub async fn submit_bid(
        &self,
        rfq: &Rfq,
        estimated_cost_usd: f64,
        estimated_duration_ms: u64,
        estimated_tokens: u64,
    ) -> Result<(), DelegateError> {
        let originator = self
            .mesh
            .peer(&rfq.originator_node_id)
            .ok_or(DelegateError::NoPeers)?;
        let bid = Bid {
            bid_id: uuid::Uuid::new_v4().to_string(),
            rfq_id: rfq.rfq_id.clone(),
            bidder_node_id: self.mesh.identity().node_id.clone(),
            estimated_cost_usd,
            estimated_duration_ms,
            estimated_tokens,
            capabilities_offered: self.mesh.identity().capabilities.clone(),
            round: 0,
            nonce: rand::random(),
            expires_at: rfq.bid_deadline,
        };
        let envelope = BidEnvelope {
            request_id: new_request_id(),
            originator_node_id: self.mesh.identity().node_id.clone(),
            bid,
        };
        self.client
            .send_bid(&originator.identity.api_url, envelope)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SwarmHandlers for CoreServices {
    async fn on_task_request(&self, request: SwarmTaskRequest) -> TaskDecision {
        let task_id = request.task_id.clone();
        if self.task_inbox_tx.send(request).is_err() {
            return TaskDecision::rejected(task_id, "node is not accepting work");
        }
        TaskDecision::accepted(task_id)
    }

    async fn on_task_result(&self, result: SwarmTaskResult) {
        if self.settle_result(&result).is_none() {
            warn!(task_id = %result.task_id, "result for unknown delegation ignored");
        }
    }

    async fn on_rfq(&self, rfq: Rfq) {
        let _ = self.rfq_inbox_tx.send(rfq);
    }

    async fn on_bid(&self, bid: Bid) -> BidAck {
        match self.auction.receive_bid(bid) {
            Ok(()) => BidAck {
                accepted: true,
                reason: None,
            },
            Err(rejection) => BidAck {
                accepted: false,
                reason: Some(rejection.to_string()),
            },
        }
    }

    async fn on_checkpoint(&self, checkpoint: TaskCheckpoint) -> bool {
        // A checkpoint for a task no longer in flight means the worker
        // should stop: the delegation timed out or was aborted here.
        let abort_requested = !self.outstanding.lock().contains_key(&checkpoint.task_id);
        if let Err(err) = self.accept_checkpoint(checkpoint) {
            warn!(error = %err, "failed to persist inbound checkpoint");
        }
        abort_requested
    }
}

fn best_trust(peers: &[PeerEntry], reputation: &ReputationStore) -> f64 {
    peers
        .iter()
        .map(|p| reputation.trust_score(&p.identity.node_id))
        .fold(0.0, f64::max)
}

/// Running core loops; dropping aborts them, `shutdown` drains them.
pub struct CoreHandle {
    mesh: Option<MeshHandle>,
    watchdog: Option<tokio::task::JoinHandle<()>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CoreHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.await;
        }
        if let Some(mesh) = self.mesh.take() {
            mesh.shutdown().await;
        }
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }
}
