//! Inbound side of the peer wire protocol: the axum routes a node
//! exposes to its peers.
//!
//! The server owns nothing; it validates, deduplicates on `task_id`, and
//! forwards to the mesh manager and the embedder's [`SwarmHandlers`].
//! Duplicate task dispatches echo the decision made on first delivery
//! without re-execution.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::wire::{
    Ack, BID_PATH, BidAck, BidEnvelope, CHECKPOINT_PATH, CheckpointAck, CheckpointEnvelope,
    ErrorBody, HEARTBEAT_PATH, HELLO_PATH, HeartbeatReply, HeartbeatRequest, HelloReply,
    HelloRequest, RFQ_PATH, RfqEnvelope, TASK_REQUEST_PATH, TASK_RESULT_PATH, TaskDecision,
    TaskRequestEnvelope, TaskResultEnvelope,
};
use crate::mesh::{JoinOutcome, MeshManager};
use crate::types::{Bid, Rfq, SwarmTaskRequest, SwarmTaskResult};

type Rejection = (StatusCode, Json<ErrorBody>);

/// Cap on remembered task decisions; the least recently replayed fall
/// off first.
const SEEN_TASKS_CAP: usize = 4_096;

struct SeenTask {
    decision: TaskDecision,
    touched: u64,
}

/// Recently decided task dispatches, LRU-capped. A retried `task_id`
/// gets the decision made on first delivery — including a rejection —
/// rather than a synthesized acceptance.
struct DecisionCache {
    cap: usize,
    clock: u64,
    tasks: FxHashMap<String, SeenTask>,
}

impl DecisionCache {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            clock: 0,
            tasks: FxHashMap::default(),
        }
    }

    fn get(&mut self, task_id: &str) -> Option<TaskDecision> {
        self.clock += 1;
        let clock = self.clock;
        self.tasks.get_mut(task_id).map(|entry| {
            entry.touched = clock;
            entry.decision.clone()
        })
    }

    /// Store a decision; the first delivery's decision wins a race, and
    /// whatever ends up stored is what the caller must reply with.
    fn record(&mut self, task_id: String, decision: TaskDecision) -> TaskDecision {
        self.clock += 1;
        let touched = self.clock;
        let stored = {
            let entry = self
                .tasks
                .entry(task_id)
                .or_insert(SeenTask { decision, touched });
            entry.touched = touched;
            entry.decision.clone()
        };
        self.evict_over_cap();
        stored
    }

    fn evict_over_cap(&mut self) {
        while self.tasks.len() > self.cap {
            if let Some(oldest) = self
                .tasks
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                self.tasks.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// What the embedding node does with inbound swarm traffic.
///
/// The pipeline implements this for originator-side callbacks (results,
/// bids, checkpoints); the worker side (`on_task_request`) is where the
/// embedder's executor accepts or refuses work.
#[async_trait]
pub trait SwarmHandlers: Send + Sync {
    /// A peer asks this node to execute a task.
    async fn on_task_request(&self, request: SwarmTaskRequest) -> TaskDecision;

    /// A worker delivers the result of a task this node delegated.
    async fn on_task_result(&self, result: SwarmTaskResult);

    /// A peer invites this node to bid.
    async fn on_rfq(&self, rfq: Rfq);

    /// A bidder answers this node's RFQ.
    async fn on_bid(&self, bid: Bid) -> BidAck;

    /// A worker checkpoints a task this node delegated. Returning `true`
    /// asks the worker to abort.
    async fn on_checkpoint(&self, checkpoint: crate::checkpoint::TaskCheckpoint) -> bool;
}

/// Shared state behind the swarm routes.
pub struct SwarmApi {
    mesh: Arc<MeshManager>,
    handlers: Arc<dyn SwarmHandlers>,
    api_token: Option<String>,
    seen_tasks: Mutex<DecisionCache>,
}

impl SwarmApi {
    pub fn new(mesh: Arc<MeshManager>, handlers: Arc<dyn SwarmHandlers>) -> Self {
        Self {
            mesh,
            handlers,
            api_token: None,
            seen_tasks: Mutex::new(DecisionCache::new(SEEN_TASKS_CAP)),
        }
    }

    /// Require `Authorization: Bearer <token>` on every request.
    #[must_use]
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Rejection> {
        let Some(expected) = &self.api_token else {
            return Ok(());
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(reject(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid bearer token",
            ))
        }
    }
}

fn reject(status: StatusCode, code: &str, reason: impl Into<String>) -> Rejection {
    (status, Json(ErrorBody::new(code, reason)))
}

/// Build the swarm router over shared state.
pub fn router(api: Arc<SwarmApi>) -> Router {
    Router::new()
        .route(HELLO_PATH, post(hello))
        .route(HEARTBEAT_PATH, post(heartbeat))
        .route(TASK_REQUEST_PATH, post(task_request))
        .route(TASK_RESULT_PATH, post(task_result))
        .route(RFQ_PATH, post(rfq))
        .route(BID_PATH, post(bid))
        .route(CHECKPOINT_PATH, post(checkpoint))
        .with_state(api)
}

/// Bind and serve until the process stops.
pub async fn serve(api: Arc<SwarmApi>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "swarm api listening");
    axum::serve(listener, router(api)).await
}

async fn hello(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(request): Json<HelloRequest>,
) -> Result<Json<HelloReply>, Rejection> {
    api.authorize(&headers)?;

    // A challenged peer answering its puzzle.
    if let Some(solution) = &request.pow_solution {
        if !api.mesh.verify_join_pow(&request.originator.node_id, solution) {
            return Err(reject(
                StatusCode::FORBIDDEN,
                "pow_rejected",
                "proof-of-work solution does not satisfy the challenge",
            ));
        }
        return Ok(Json(HelloReply {
            identity: api.mesh.identity().clone(),
            challenge: None,
        }));
    }

    let challenge = match api.mesh.handle_join(request.originator) {
        JoinOutcome::Active { .. } => None,
        JoinOutcome::ChallengeRequired { challenge, .. } => Some(challenge),
    };
    Ok(Json(HelloReply {
        identity: api.mesh.identity().clone(),
        challenge,
    }))
}

async fn heartbeat(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatReply>, Rejection> {
    api.authorize(&headers)?;
    let latency = (Utc::now() - request.sent_at).num_milliseconds().max(0) as u64;
    api.mesh
        .handle_heartbeat(request.originator, Some(latency));
    Ok(Json(HeartbeatReply {
        node_id: api.mesh.identity().node_id.clone(),
        received_at: Utc::now(),
    }))
}

async fn task_request(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(envelope): Json<TaskRequestEnvelope>,
) -> Result<Json<TaskDecision>, Rejection> {
    api.authorize(&headers)?;
    let task_id = envelope.request.task_id.clone();
    if let Some(prior) = api.seen_tasks.lock().get(&task_id) {
        // Redelivery: echo whatever we decided the first time.
        debug!(%task_id, accepted = prior.accepted, "duplicate task dispatch");
        return Ok(Json(prior));
    }
    let decision = api.handlers.on_task_request(envelope.request).await;
    Ok(Json(api.seen_tasks.lock().record(task_id, decision)))
}

async fn task_result(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(envelope): Json<TaskResultEnvelope>,
) -> Result<Json<Ack>, Rejection> {
    api.authorize(&headers)?;
    api.handlers.on_task_result(envelope.result).await;
    Ok(Json(Ack::ok()))
}

async fn rfq(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(envelope): Json<RfqEnvelope>,
) -> Result<Json<Ack>, Rejection> {
    api.authorize(&headers)?;
    api.handlers.on_rfq(envelope.rfq).await;
    Ok(Json(Ack::ok()))
}

async fn bid(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(envelope): Json<BidEnvelope>,
) -> Result<Json<BidAck>, Rejection> {
    api.authorize(&headers)?;
    Ok(Json(api.handlers.on_bid(envelope.bid).await))
}

async fn checkpoint(
    State(api): State<Arc<SwarmApi>>,
    headers: HeaderMap,
    Json(envelope): Json<CheckpointEnvelope>,
) -> Result<Json<CheckpointAck>, Rejection> {
    api.authorize(&headers)?;
    let abort_requested = api.handlers.on_checkpoint(envelope.checkpoint).await;
    Ok(Json(CheckpointAck {
        ok: true,
        abort_requested,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_cache_echoes_the_first_decision() {
        let mut cache = DecisionCache::new(8);
        assert!(cache.get("t1").is_none());

        let first = cache.record(
            "t1".to_string(),
            TaskDecision::rejected("t1", "inbox closed"),
        );
        assert!(!first.accepted);

        // A racing second record does not overwrite the stored decision.
        let raced = cache.record("t1".to_string(), TaskDecision::accepted("t1"));
        assert!(!raced.accepted);
        assert_eq!(cache.get("t1").unwrap(), first);
    }

    #[test]
    fn decision_cache_evicts_least_recently_replayed() {
        let mut cache = DecisionCache::new(2);
        cache.record("t1".to_string(), TaskDecision::accepted("t1"));
        cache.record("t2".to_string(), TaskDecision::accepted("t2"));

        // Touch t1 so t2 is the eviction candidate.
        cache.get("t1");
        cache.record("t3".to_string(), TaskDecision::accepted("t3"));

        assert!(cache.get("t1").is_some());
        assert!(cache.get("t2").is_none());
        assert!(cache.get("t3").is_some());
    }
}
