//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use weavemesh::transport::client::{DispatchMode, PeerClient, TransportError};
use weavemesh::transport::wire::{
    BidAck, BidEnvelope, CheckpointAck, CheckpointEnvelope, HelloReply, HelloRequest, RfqEnvelope,
    TaskDecision, TaskRequestEnvelope, TaskResultEnvelope,
};
use weavemesh::types::{AttributeLevel, NodeIdentity, TaskAttributes, TaskConstraints};

/// A peer client that records traffic and accepts everything, so
/// pipeline tests run without sockets.
#[derive(Default)]
pub struct ScriptedClient {
    pub tasks_sent: Mutex<Vec<TaskRequestEnvelope>>,
    pub rfqs_sent: Mutex<Vec<RfqEnvelope>>,
    pub bids_sent: Mutex<Vec<BidEnvelope>>,
    /// Peers (by api_url) that refuse task dispatches.
    pub refuse_tasks_from: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PeerClient for ScriptedClient {
    async fn hello(
        &self,
        _api_url: &str,
        request: HelloRequest,
    ) -> Result<HelloReply, TransportError> {
        Ok(HelloReply {
            identity: request.originator,
            challenge: None,
        })
    }

    async fn heartbeat(
        &self,
        _api_url: &str,
        _identity: NodeIdentity,
    ) -> Result<u64, TransportError> {
        Ok(10)
    }

    async fn send_task(
        &self,
        api_url: &str,
        envelope: TaskRequestEnvelope,
        _mode: DispatchMode,
    ) -> Result<TaskDecision, TransportError> {
        let task_id = envelope.request.task_id.clone();
        self.tasks_sent.lock().push(envelope);
        if self.refuse_tasks_from.lock().iter().any(|u| u == api_url) {
            return Ok(TaskDecision::rejected(task_id, "busy"));
        }
        Ok(TaskDecision::accepted(task_id))
    }

    async fn send_result(
        &self,
        _api_url: &str,
        _envelope: TaskResultEnvelope,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_rfq(&self, _api_url: &str, envelope: RfqEnvelope) -> Result<(), TransportError> {
        self.rfqs_sent.lock().push(envelope);
        Ok(())
    }

    async fn send_bid(
        &self,
        _api_url: &str,
        envelope: BidEnvelope,
    ) -> Result<BidAck, TransportError> {
        self.bids_sent.lock().push(envelope);
        Ok(BidAck {
            accepted: true,
            reason: None,
        })
    }

    async fn send_checkpoint(
        &self,
        _api_url: &str,
        _envelope: CheckpointEnvelope,
    ) -> Result<CheckpointAck, TransportError> {
        Ok(CheckpointAck {
            ok: true,
            abort_requested: false,
        })
    }
}

pub fn identity(name: &str) -> NodeIdentity {
    NodeIdentity::new(name, format!("http://{name}.mesh.test:7437"))
        .with_capabilities(["read-file", "summarize"])
}

/// A routine, delegatable attribute set (routes to `any`).
pub fn routine_attributes() -> TaskAttributes {
    TaskAttributes {
        complexity: AttributeLevel::Medium,
        criticality: AttributeLevel::Low,
        verifiability: AttributeLevel::Medium,
        reversibility: AttributeLevel::High,
        ..TaskAttributes::default()
    }
}

pub fn tight_constraints(max_duration_ms: u64) -> TaskConstraints {
    TaskConstraints {
        max_duration_ms,
        max_tokens: 10_000,
        max_cost_usd: 1.0,
        tool_allowlist: vec!["read-file".to_string(), "summarize".to_string()],
        min_findings: None,
    }
}
