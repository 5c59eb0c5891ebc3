use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;
use weavemesh::checkpoint::TaskCheckpoint;
use weavemesh::config::{JournalConfig, MeshConfig};
use weavemesh::decompose::SubTask;
use weavemesh::journal::EventKind;
use weavemesh::mesh::PeerEntry;
use weavemesh::pipeline::{CoreBuilder, CoreServices, DelegateError};
use weavemesh::transport::client::DispatchMode;
use weavemesh::types::{AttributeLevel, Finding, SwarmTaskResult, TaskAttributes};

mod common;
use common::{ScriptedClient, identity, routine_attributes, tight_constraints};

struct Harness {
    core: Arc<CoreServices>,
    _dir: tempfile::TempDir,
}

fn harness(client: Arc<ScriptedClient>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = MeshConfig {
        min_bond_usd: 0.10,
        slash_pct_on_violation: 0.5,
        slash_pct_on_timeout: 0.25,
        redelegation_cooldown_ms: 0,
        required_voters: 1,
        required_agreement: 0.67,
        journal: JournalConfig::at(dir.path().join("journal.jsonl")),
        ..MeshConfig::default()
    };
    let core = CoreBuilder::new(config, identity("local"))
        .with_client(client)
        .with_checkpoint_path(dir.path().join("checkpoints.jsonl"))
        .build()
        .unwrap();
    Harness { core, _dir: dir }
}

fn join_peer(core: &CoreServices, name: &str) -> PeerEntry {
    let peer_identity = identity(name);
    let node_id = peer_identity.node_id.clone();
    core.mesh.handle_join(peer_identity);
    core.escrow.deposit(&node_id, 1.0).unwrap();
    core.mesh.peer(&node_id).unwrap()
}

fn sub_task(max_duration_ms: u64) -> SubTask {
    SubTask {
        sub_task_id: Uuid::new_v4().to_string(),
        text: "summarize the last ten journal entries for the keeper".to_string(),
        attributes: routine_attributes(),
        constraints: tight_constraints(max_duration_ms),
        depends_on: Vec::new(),
    }
}

fn result_for(task: &SubTask, peer: &PeerEntry, duration_ms: u64) -> SwarmTaskResult {
    SwarmTaskResult::completed(&task.sub_task_id, &peer.identity.node_id)
        .with_findings(vec![Finding::new("read-file", "read the entries")])
        .with_usage(1_000, 0.05, duration_ms)
}

#[tokio::test]
async fn slow_peer_is_slashed_and_redelegation_wins() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let fast = join_peer(&h.core, "fast-peer");
    let slow = join_peer(&h.core, "slow-peer");
    let task = sub_task(500);

    // First attempt lands on the slow peer.
    let active = h
        .core
        .delegate_to("s1", &task, slow.clone(), DispatchMode::Fast, false)
        .await
        .unwrap();
    assert!((h.core.escrow.free_balance(&slow.identity.node_id) - 0.90).abs() < 1e-9);
    assert_eq!(active.contract.task_id, task.sub_task_id);

    // The result limps in at 2800 ms against a 500 ms cap.
    let report = h
        .core
        .settle_result(&result_for(&task, &slow, 2_800))
        .unwrap();
    assert!(!report.verification.verified);
    assert!(!report.verification.slo_compliance);
    assert!((report.slashed_usd - 0.05).abs() < 1e-9);
    assert!(report.redelegation_allowed);

    // Half the bond went to the sink: deposit − 0.05 remains.
    assert!((h.core.escrow.free_balance(&slow.identity.node_id) - 0.95).abs() < 1e-9);
    let slow_rep = h.core.reputation.snapshot(&slow.identity.node_id).unwrap();
    assert_eq!(slow_rep.tasks_failed, 1);

    // Re-delegate the same task to the fast peer.
    h.core
        .delegate_to("s1", &task, fast.clone(), DispatchMode::Fast, false)
        .await
        .unwrap();
    let report = h
        .core
        .settle_result(&result_for(&task, &fast, 200))
        .unwrap();
    assert!(report.verification.verified);
    assert!((report.released_usd - 0.10).abs() < 1e-9);

    // Bond released in full; the fast peer's record shows the completion.
    assert!((h.core.escrow.free_balance(&fast.identity.node_id) - 1.0).abs() < 1e-9);
    let fast_rep = h.core.reputation.snapshot(&fast.identity.node_id).unwrap();
    assert_eq!(fast_rep.tasks_completed, 1);
    assert_eq!(fast_rep.tasks_failed, 0);
    assert!(h.core.outstanding().is_empty());

    // The journal tells the whole story, including the local consensus
    // vote evaluated on each settlement.
    let events = h
        .core
        .journal
        .read_session("s1", weavemesh::journal::ReadOptions::default())
        .unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind.clone()).collect();
    assert!(kinds.contains(&EventKind::SloViolation));
    assert!(kinds.contains(&EventKind::ConsensusEvaluated));
    assert!(kinds.contains(&EventKind::ReputationUpdated));
}

#[tokio::test]
async fn timeouts_slash_by_the_timeout_policy() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "sleepy");
    let task = sub_task(500);

    let active = h
        .core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await
        .unwrap();

    let expired = h.core.check_timeouts_at(active.deadline + Duration::seconds(1));
    assert_eq!(expired, vec![task.sub_task_id.clone()]);

    // 25% of the 0.10 bond is gone; the rest came back.
    assert!((h.core.escrow.free_balance(&peer.identity.node_id) - 0.975).abs() < 1e-9);
    assert!((h.core.escrow.slashed_sink() - 0.025).abs() < 1e-9);
    assert_eq!(
        h.core
            .reputation
            .snapshot(&peer.identity.node_id)
            .unwrap()
            .tasks_failed,
        1
    );
    assert!(h.core.outstanding().is_empty());

    // Settling the late result after expiry is a no-op.
    assert!(h.core.settle_result(&result_for(&task, &peer, 9_000)).is_none());
}

#[tokio::test]
async fn firebreak_demands_confirmation_for_risky_work() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "worker");

    let mut task = sub_task(5_000);
    task.attributes = TaskAttributes {
        criticality: AttributeLevel::High,
        reversibility: AttributeLevel::Low,
        ..routine_attributes()
    };

    let denied = h
        .core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await;
    assert!(matches!(denied, Err(DelegateError::ConfirmationRequired { .. })));
    // Nothing was dispatched and no bond is held.
    assert!(client.tasks_sent.lock().is_empty());
    assert!((h.core.escrow.free_balance(&peer.identity.node_id) - 1.0).abs() < 1e-9);

    // With sign-off the dispatch proceeds.
    h.core
        .delegate_to("s1", &task, peer, DispatchMode::Fast, true)
        .await
        .unwrap();
    assert_eq!(client.tasks_sent.lock().len(), 1);
}

#[tokio::test]
async fn rejected_dispatch_returns_the_bond() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "refuser");
    client
        .refuse_tasks_from
        .lock()
        .push(peer.identity.api_url.clone());

    let task = sub_task(5_000);
    let outcome = h
        .core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await;
    assert!(matches!(outcome, Err(DelegateError::Rejected { .. })));
    assert!((h.core.escrow.free_balance(&peer.identity.node_id) - 1.0).abs() < 1e-9);
    assert!(h.core.outstanding().is_empty());
}

#[tokio::test]
async fn exhausted_chains_stop_redelegating() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "churner");
    let task = sub_task(500);

    // Initial attempt plus the full retry budget.
    for _ in 0..=h.core.config.max_redelegations {
        h.core
            .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
            .await
            .unwrap();
        h.core
            .settle_result(&result_for(&task, &peer, 9_000))
            .unwrap();
    }

    let exhausted = h
        .core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await;
    assert!(matches!(exhausted, Err(DelegateError::Redelegation(_))));
}

#[tokio::test]
async fn quarantined_peers_are_not_eligible() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "rogue");

    assert_eq!(h.core.eligible_peers(&[]).len(), 1);
    h.core.anomaly.quarantine(&peer.identity.node_id);
    assert!(h.core.eligible_peers(&[]).is_empty());

    let task = sub_task(5_000);
    let outcome = h.core.delegate("s1", &task, DispatchMode::Fast, false).await;
    assert!(matches!(outcome, Err(DelegateError::NoPeers)));
}

#[tokio::test]
async fn checkpoints_are_stored_and_scanned() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "worker");
    let task = sub_task(1_000);

    h.core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await
        .unwrap();

    // A checkpoint deep past the duration cap trips the running-task rule.
    let checkpoint = TaskCheckpoint::new(
        &task.sub_task_id,
        &peer.identity.node_id,
        json!({ "phase": "wandering" }),
    )
    .with_progress(vec![Finding::new("read-file", "partial")], 500, 0.01, 5_000);
    h.core.accept_checkpoint(checkpoint).unwrap();

    assert!(h.core.checkpoints.can_resume(&task.sub_task_id));
    let anomalies = h
        .core
        .journal
        .read_session(&task.sub_task_id, weavemesh::journal::ReadOptions::default())
        .unwrap();
    assert!(
        anomalies
            .iter()
            .any(|e| e.kind == EventKind::AnomalyDetected)
    );

    // Verified completion finalizes the task's checkpoints.
    let report = h
        .core
        .settle_result(&result_for(&task, &peer, 200))
        .unwrap();
    assert!(report.verification.verified);
    assert!(!h.core.checkpoints.can_resume(&task.sub_task_id));
}

#[tokio::test]
async fn aborting_returns_the_bond_and_signals_the_worker() {
    use weavemesh::transport::server::SwarmHandlers;

    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "worker");
    let task = sub_task(5_000);

    h.core
        .delegate_to("s1", &task, peer.clone(), DispatchMode::Fast, false)
        .await
        .unwrap();
    assert!(h.core.abort_delegation(&task.sub_task_id));
    assert!(!h.core.abort_delegation(&task.sub_task_id));

    // No fault: the bond comes back whole, the outcome is an abort.
    assert!((h.core.escrow.free_balance(&peer.identity.node_id) - 1.0).abs() < 1e-9);
    assert_eq!(
        h.core
            .reputation
            .snapshot(&peer.identity.node_id)
            .unwrap()
            .tasks_aborted,
        1
    );

    // The worker's next checkpoint ack carries the abort signal.
    let checkpoint = TaskCheckpoint::new(&task.sub_task_id, &peer.identity.node_id, json!({}));
    assert!(h.core.on_checkpoint(checkpoint).await);
}

#[tokio::test]
async fn human_routed_subtasks_never_dispatch() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    join_peer(&h.core, "worker");

    let mut task = sub_task(5_000);
    task.attributes.delegation_target =
        Some(weavemesh::types::DelegationTarget::Human);

    let outcome = h.core.delegate("s1", &task, DispatchMode::Fast, false).await;
    assert!(matches!(outcome, Err(DelegateError::HumanRequired { .. })));
    assert!(client.tasks_sent.lock().is_empty());
}

#[tokio::test]
async fn auctioned_delegation_dispatches_to_the_winner() {
    let client = ScriptedClient::new();
    let h = harness(Arc::clone(&client));
    let peer = join_peer(&h.core, "bidder");
    let task = sub_task(5_000);

    // Feed the winning bid in as soon as the RFQ goes out.
    let core = Arc::clone(&h.core);
    let bid_task = {
        let client = Arc::clone(&client);
        let bidder = peer.identity.node_id.clone();
        tokio::spawn(async move {
            loop {
                let rfq = client.rfqs_sent.lock().last().map(|env| env.rfq.clone());
                if let Some(rfq) = rfq {
                    let bid = weavemesh::types::Bid {
                        bid_id: Uuid::new_v4().to_string(),
                        rfq_id: rfq.rfq_id.clone(),
                        bidder_node_id: bidder.clone(),
                        estimated_cost_usd: 0.05,
                        estimated_duration_ms: 1_000,
                        estimated_tokens: 500,
                        capabilities_offered: ["read-file".to_string()].into_iter().collect(),
                        round: 0,
                        nonce: 1,
                        expires_at: Utc::now() + Duration::seconds(30),
                    };
                    core.auction.receive_bid(bid).unwrap();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
    };

    let active = h
        .core
        .delegate("s1", &task, DispatchMode::Fast, false)
        .await
        .unwrap();
    bid_task.await.unwrap();

    assert_eq!(active.peer.identity.node_id, peer.identity.node_id);
    assert_eq!(client.tasks_sent.lock().len(), 1);
    assert!((h.core.escrow.free_balance(&peer.identity.node_id) - 0.90).abs() < 1e-9);
}
