//! Outbound side of the peer wire protocol.
//!
//! A [`PeerClient`] is injected wherever the core needs to talk to a
//! peer, so tests can swap the HTTP implementation for a scripted one.
//! Task dispatch deadlines depend on the dispatch mode; auction
//! broadcasts are fire-and-forget per peer.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use super::wire::{
    Ack, BID_PATH, BidAck, BidEnvelope, CHECKPOINT_PATH, CheckpointAck, CheckpointEnvelope,
    ErrorBody, HEARTBEAT_PATH, HELLO_PATH, HeartbeatReply, HeartbeatRequest, HelloReply,
    HelloRequest, RFQ_PATH, RfqEnvelope, TASK_REQUEST_PATH, TASK_RESULT_PATH, TaskDecision,
    TaskRequestEnvelope, TaskResultEnvelope, new_request_id,
};
use crate::types::NodeIdentity;

/// How urgently a dispatched task is expected to answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Quick tool-style calls.
    Fast,
    /// A human or long-thinking peer may be on the other end.
    Interactive,
    /// Emulated worlds run on their own clock.
    Simulation,
}

impl DispatchMode {
    pub fn deadline(self) -> Duration {
        match self {
            DispatchMode::Fast => Duration::from_secs(10),
            DispatchMode::Interactive => Duration::from_secs(60),
            DispatchMode::Simulation => Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    #[diagnostic(code(weavemesh::transport::timeout))]
    Timeout { url: String },

    /// 4xx with a machine-readable body: the peer refused, don't retry.
    #[error("peer rejected the request: {error_code}: {reason}")]
    #[diagnostic(code(weavemesh::transport::rejected))]
    Rejected { error_code: String, reason: String },

    /// 5xx: the peer is unhealthy, retriable.
    #[error("peer returned status {status}")]
    #[diagnostic(code(weavemesh::transport::status))]
    Status { status: u16 },

    #[error("transport failure")]
    #[diagnostic(code(weavemesh::transport::http))]
    Http(#[from] reqwest::Error),
}

/// The outbound operations the core performs against a peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn hello(&self, api_url: &str, request: HelloRequest)
    -> Result<HelloReply, TransportError>;

    /// Returns the measured round-trip latency in milliseconds.
    async fn heartbeat(
        &self,
        api_url: &str,
        identity: NodeIdentity,
    ) -> Result<u64, TransportError>;

    async fn send_task(
        &self,
        api_url: &str,
        envelope: TaskRequestEnvelope,
        mode: DispatchMode,
    ) -> Result<TaskDecision, TransportError>;

    async fn send_result(
        &self,
        api_url: &str,
        envelope: TaskResultEnvelope,
    ) -> Result<(), TransportError>;

    async fn send_rfq(&self, api_url: &str, envelope: RfqEnvelope) -> Result<(), TransportError>;

    async fn send_bid(&self, api_url: &str, envelope: BidEnvelope)
    -> Result<BidAck, TransportError>;

    /// The ack doubles as the abort channel: `abort_requested` tells the
    /// worker to stop and finalize.
    async fn send_checkpoint(
        &self,
        api_url: &str,
        envelope: CheckpointEnvelope,
    ) -> Result<CheckpointAck, TransportError>;
}

/// Production client over reqwest with rustls.
pub struct HttpPeerClient {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPeerClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            default_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}{path}", base.trim_end_matches('/'))
    }

    async fn post_json<B, R>(
        &self,
        url: String,
        body: &B,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout { url: url.clone() }
                } else {
                    TransportError::Http(err)
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let body: ErrorBody = response.json().await.unwrap_or_else(|_| {
                ErrorBody::new("unknown", format!("status {}", status.as_u16()))
            });
            return Err(TransportError::Rejected {
                error_code: body.error_code,
                reason: body.reason,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn hello(
        &self,
        api_url: &str,
        request: HelloRequest,
    ) -> Result<HelloReply, TransportError> {
        self.post_json(
            Self::url(api_url, HELLO_PATH),
            &request,
            self.default_timeout,
        )
        .await
    }

    async fn heartbeat(
        &self,
        api_url: &str,
        identity: NodeIdentity,
    ) -> Result<u64, TransportError> {
        let request = HeartbeatRequest {
            request_id: new_request_id(),
            originator: identity,
            sent_at: chrono::Utc::now(),
        };
        let started = Instant::now();
        let _reply: HeartbeatReply = self
            .post_json(
                Self::url(api_url, HEARTBEAT_PATH),
                &request,
                self.default_timeout,
            )
            .await?;
        Ok(started.elapsed().as_millis() as u64)
    }

    async fn send_task(
        &self,
        api_url: &str,
        envelope: TaskRequestEnvelope,
        mode: DispatchMode,
    ) -> Result<TaskDecision, TransportError> {
        self.post_json(
            Self::url(api_url, TASK_REQUEST_PATH),
            &envelope,
            mode.deadline(),
        )
        .await
    }

    async fn send_result(
        &self,
        api_url: &str,
        envelope: TaskResultEnvelope,
    ) -> Result<(), TransportError> {
        let _: Ack = self
            .post_json(
                Self::url(api_url, TASK_RESULT_PATH),
                &envelope,
                self.default_timeout,
            )
            .await?;
        Ok(())
    }

    async fn send_rfq(&self, api_url: &str, envelope: RfqEnvelope) -> Result<(), TransportError> {
        let _: Ack = self
            .post_json(Self::url(api_url, RFQ_PATH), &envelope, self.default_timeout)
            .await?;
        Ok(())
    }

    async fn send_bid(
        &self,
        api_url: &str,
        envelope: BidEnvelope,
    ) -> Result<BidAck, TransportError> {
        self.post_json(Self::url(api_url, BID_PATH), &envelope, self.default_timeout)
            .await
    }

    async fn send_checkpoint(
        &self,
        api_url: &str,
        envelope: CheckpointEnvelope,
    ) -> Result<CheckpointAck, TransportError> {
        self.post_json(
            Self::url(api_url, CHECKPOINT_PATH),
            &envelope,
            self.default_timeout,
        )
        .await
    }
}

impl std::fmt::Debug for HttpPeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPeerClient")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

// Retriability is a property of the error kind, used by callers that
// loop: 5xx and timeouts may be retried, rejections may not.
impl TransportError {
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Timeout { .. } | TransportError::Status { .. } => true,
            TransportError::Rejected { .. } => false,
            TransportError::Http(err) => err.status().is_none_or(|s| s.is_server_error()),
        }
    }
}
