//! Request and reply bodies for the swarm endpoints.
//!
//! Every request carries the originator's node id and a request id so
//! receivers can correlate and deduplicate. Rejections are 4xx with a
//! machine-readable [`ErrorBody`]; 5xx means retriable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::TaskCheckpoint;
use crate::sybil::PowChallenge;
use crate::types::{Bid, NodeIdentity, Rfq, SwarmTaskRequest, SwarmTaskResult};

pub const HELLO_PATH: &str = "/api/swarm/hello";
pub const HEARTBEAT_PATH: &str = "/api/swarm/heartbeat";
pub const TASK_REQUEST_PATH: &str = "/api/swarm/task.request";
pub const TASK_RESULT_PATH: &str = "/api/swarm/task.result";
pub const RFQ_PATH: &str = "/api/swarm/rfq";
pub const BID_PATH: &str = "/api/swarm/bid";
pub const CHECKPOINT_PATH: &str = "/api/swarm/checkpoint";

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Machine-readable rejection body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error_code: String,
    pub reason: String,
}

impl ErrorBody {
    pub fn new(error_code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            reason: reason.into(),
        }
    }
}

/// Identity exchange on first contact. A returning peer that was
/// challenged submits its proof-of-work solution here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HelloRequest {
    pub request_id: String,
    pub originator: NodeIdentity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pow_solution: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HelloReply {
    pub identity: NodeIdentity,
    /// Set when the caller must solve a proof-of-work before going active.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub challenge: Option<PowChallenge>,
}

/// One-shot liveness plus identity refresh.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    pub request_id: String,
    pub originator: NodeIdentity,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatReply {
    pub node_id: String,
    pub received_at: DateTime<Utc>,
}

/// Originator → worker task dispatch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskRequestEnvelope {
    pub request_id: String,
    pub originator_node_id: String,
    pub request: SwarmTaskRequest,
}

/// Accept/reject answer to a task dispatch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskDecision {
    pub task_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl TaskDecision {
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Worker → originator result callback.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskResultEnvelope {
    pub request_id: String,
    pub originator_node_id: String,
    pub result: SwarmTaskResult,
}

/// Originator broadcast to all active peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RfqEnvelope {
    pub request_id: String,
    pub originator_node_id: String,
    pub rfq: Rfq,
}

/// Bidder → originator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BidEnvelope {
    pub request_id: String,
    pub originator_node_id: String,
    pub bid: Bid,
}

/// Whether the receiver kept the bid. A discarded duplicate is not an
/// error; the reason says why it was dropped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BidAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// Worker → originator mid-task checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEnvelope {
    pub request_id: String,
    pub originator_node_id: String,
    pub checkpoint: TaskCheckpoint,
}

/// Reply to a checkpoint. Abort signals ride on this ack: a worker that
/// checkpoints a task its originator no longer tracks is told to stop.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointAck {
    pub ok: bool,
    pub abort_requested: bool,
}

/// Generic acknowledgement for fire-and-forget messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
