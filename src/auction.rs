//! Task auctions: RFQ broadcast, bid collection, scoring, and award.
//!
//! The originator opens an auction, fans the RFQ out to every active
//! peer through a bounded worker pool, and collects bids until the
//! deadline. Bids are scored against the RFQ's constraints with the
//! bidder's trust folded in; the award either picks the best bid or
//! expires the auction when too few bids arrived.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::journal::{EventKind, Journal};
use crate::mesh::PeerEntry;
use crate::reputation::ReputationStore;
use crate::transport::client::PeerClient;
use crate::transport::wire::{RfqEnvelope, new_request_id};
use crate::types::{Bid, NodeIdentity, Rfq, TaskConstraints};

/// Parallelism of the RFQ broadcast pool.
const BROADCAST_CONCURRENCY: usize = 8;

/// Terminal auctions older than this are dropped by `cleanup`.
const TERMINAL_RETENTION: Duration = Duration::hours(1);

/// Bid score weights; they sum to 1.0.
const WEIGHT_TRUST: f64 = 0.4;
const WEIGHT_LATENCY: f64 = 0.2;
const WEIGHT_COST: f64 = 0.2;
const WEIGHT_CAPABILITIES: f64 = 0.2;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Open,
    Collecting,
    Evaluating,
    Awarded,
    Expired,
    Cancelled,
}

impl AuctionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuctionStatus::Awarded | AuctionStatus::Expired | AuctionStatus::Cancelled
        )
    }

    fn accepts_bids(self) -> bool {
        matches!(self, AuctionStatus::Open | AuctionStatus::Collecting)
    }
}

/// One auction's full lifecycle record. Owned by [`TaskAuction`] until
/// terminal, then kept briefly for inspection and dropped by `cleanup`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuctionRecord {
    pub rfq: Rfq,
    pub session_id: String,
    pub bids: Vec<Bid>,
    pub status: AuctionStatus,
    pub winning_bid: Option<Bid>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Why a bid was not kept. Duplicates are routine, not caller errors.
#[derive(Debug, Error, Diagnostic)]
pub enum BidRejection {
    #[error("no auction with rfq {rfq_id}")]
    #[diagnostic(code(weavemesh::auction::unknown_rfq))]
    UnknownAuction { rfq_id: String },

    #[error("auction {rfq_id} is {status:?} and no longer accepts bids")]
    #[diagnostic(code(weavemesh::auction::closed))]
    Closed {
        rfq_id: String,
        status: AuctionStatus,
    },

    #[error("bid arrived after the deadline for rfq {rfq_id}")]
    #[diagnostic(code(weavemesh::auction::deadline))]
    DeadlinePassed { rfq_id: String },

    #[error("bidder {bidder} already bid in round {round} of rfq {rfq_id}")]
    #[diagnostic(code(weavemesh::auction::duplicate))]
    Duplicate {
        rfq_id: String,
        bidder: String,
        round: u32,
    },
}

/// Result of awarding an auction.
#[derive(Clone, Debug, PartialEq)]
pub struct AwardOutcome {
    pub awarded: bool,
    pub winning_bid: Option<Bid>,
}

pub struct TaskAuction {
    local: NodeIdentity,
    default_bid_deadline: Duration,
    min_bids_to_award: usize,
    reputation: Arc<ReputationStore>,
    client: Arc<dyn PeerClient>,
    auctions: Mutex<FxHashMap<String, AuctionRecord>>,
    journal: Option<Arc<Journal>>,
}

impl TaskAuction {
    pub fn new(
        local: NodeIdentity,
        default_bid_deadline_ms: u64,
        min_bids_to_award: usize,
        reputation: Arc<ReputationStore>,
        client: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            local,
            default_bid_deadline: Duration::milliseconds(default_bid_deadline_ms as i64),
            min_bids_to_award: min_bids_to_award.max(1),
            reputation,
            client,
            auctions: Mutex::new(FxHashMap::default()),
            journal: None,
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Open an auction and broadcast the RFQ to the given peers.
    ///
    /// The broadcast runs through a bounded pool with per-peer deadlines;
    /// unreachable peers are logged and skipped. The emitted
    /// `auction_created` event carries the aggregate broadcast outcome.
    pub async fn create_auction(
        &self,
        session_id: &str,
        task_text: &str,
        constraints: TaskConstraints,
        required_capabilities: impl IntoIterator<Item = String>,
        peers: &[PeerEntry],
    ) -> Rfq {
        let rfq = Rfq {
            rfq_id: Uuid::new_v4().to_string(),
            task_text: task_text.to_string(),
            originator_node_id: self.local.node_id.clone(),
            bid_deadline: Utc::now() + self.default_bid_deadline,
            constraints,
            required_capabilities: required_capabilities.into_iter().collect(),
        };

        self.auctions.lock().insert(
            rfq.rfq_id.clone(),
            AuctionRecord {
                rfq: rfq.clone(),
                session_id: session_id.to_string(),
                bids: Vec::new(),
                status: AuctionStatus::Collecting,
                winning_bid: None,
                created_at: Utc::now(),
                settled_at: None,
            },
        );

        let (reached, missed) = self.broadcast(&rfq, peers).await;

        if let Some(journal) = &self.journal {
            journal.try_emit(
                session_id,
                EventKind::AuctionCreated,
                json!({
                    "rfq_id": rfq.rfq_id,
                    "task_text": rfq.task_text,
                    "bid_deadline": rfq.bid_deadline,
                    "peers_reached": reached,
                    "peers_missed": missed,
                }),
            );
        }
        rfq
    }

    /// Fire-and-forget RFQ fan-out; returns (reached, missed).
    async fn broadcast(&self, rfq: &Rfq, peers: &[PeerEntry]) -> (usize, usize) {
        let results: Vec<bool> = futures_util::stream::iter(peers.iter().cloned())
            .map(|peer| {
                let envelope = RfqEnvelope {
                    request_id: new_request_id(),
                    originator_node_id: self.local.node_id.clone(),
                    rfq: rfq.clone(),
                };
                let client = Arc::clone(&self.client);
                async move {
                    match client.send_rfq(&peer.identity.api_url, envelope).await {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(
                                peer = %peer.identity.node_id,
                                error = %err,
                                "rfq broadcast to peer failed"
                            );
                            false
                        }
                    }
                }
            })
            .buffer_unordered(BROADCAST_CONCURRENCY)
            .collect()
            .await;
        let reached = results.iter().filter(|ok| **ok).count();
        (reached, results.len() - reached)
    }

    /// Validate and record an inbound bid.
    pub fn receive_bid(&self, bid: Bid) -> Result<(), BidRejection> {
        self.receive_bid_at(bid, Utc::now())
    }

    pub fn receive_bid_at(&self, bid: Bid, now: DateTime<Utc>) -> Result<(), BidRejection> {
        let session_id = {
            let mut auctions = self.auctions.lock();
            let record =
                auctions
                    .get_mut(&bid.rfq_id)
                    .ok_or_else(|| BidRejection::UnknownAuction {
                        rfq_id: bid.rfq_id.clone(),
                    })?;
            if !record.status.accepts_bids() {
                return Err(BidRejection::Closed {
                    rfq_id: bid.rfq_id.clone(),
                    status: record.status,
                });
            }
            if now > record.rfq.bid_deadline {
                return Err(BidRejection::DeadlinePassed {
                    rfq_id: bid.rfq_id.clone(),
                });
            }
            if record
                .bids
                .iter()
                .any(|b| b.bidder_node_id == bid.bidder_node_id && b.round == bid.round)
            {
                warn!(
                    rfq_id = %bid.rfq_id,
                    bidder = %bid.bidder_node_id,
                    "duplicate bid discarded"
                );
                return Err(BidRejection::Duplicate {
                    rfq_id: bid.rfq_id.clone(),
                    bidder: bid.bidder_node_id.clone(),
                    round: bid.round,
                });
            }
            record.bids.push(bid.clone());
            record.session_id.clone()
        };

        if let Some(journal) = &self.journal {
            journal.try_emit(
                session_id,
                EventKind::BidReceived,
                json!({
                    "rfq_id": bid.rfq_id,
                    "bid_id": bid.bid_id,
                    "bidder_node_id": bid.bidder_node_id,
                    "estimated_cost_usd": bid.estimated_cost_usd,
                    "estimated_duration_ms": bid.estimated_duration_ms,
                }),
            );
        }
        Ok(())
    }

    /// Move the auction to `evaluating` and return the best-scoring bid,
    /// or `None` when no bids arrived.
    pub fn evaluate_bids(&self, rfq_id: &str) -> Option<Bid> {
        let mut auctions = self.auctions.lock();
        let record = auctions.get_mut(rfq_id)?;
        if record.status.is_terminal() {
            return record.winning_bid.clone();
        }
        record.status = AuctionStatus::Evaluating;
        self.best_bid(record)
    }

    fn best_bid(&self, record: &AuctionRecord) -> Option<Bid> {
        record
            .bids
            .iter()
            .map(|bid| {
                let trust = self.reputation.trust_score(&bid.bidder_node_id);
                (score_bid(bid, &record.rfq, trust), bid)
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, bid)| bid.clone())
    }

    /// Wait until the deadline passes or enough bids arrive, then settle.
    pub async fn award_auction(&self, rfq_id: &str) -> AwardOutcome {
        loop {
            let wait = {
                let auctions = self.auctions.lock();
                match auctions.get(rfq_id) {
                    None => {
                        return AwardOutcome {
                            awarded: false,
                            winning_bid: None,
                        };
                    }
                    Some(record) => {
                        if record.bids.len() >= self.min_bids_to_award
                            || Utc::now() > record.rfq.bid_deadline
                            || record.status.is_terminal()
                        {
                            None
                        } else {
                            Some(std::time::Duration::from_millis(50))
                        }
                    }
                }
            };
            match wait {
                Some(pause) => tokio::time::sleep(pause).await,
                None => break,
            }
        }
        self.award_now(rfq_id)
    }

    /// Settle immediately: award the best bid if the minimum arrived,
    /// otherwise expire the auction.
    pub fn award_now(&self, rfq_id: &str) -> AwardOutcome {
        let (outcome, session_id) = {
            let mut auctions = self.auctions.lock();
            let Some(record) = auctions.get_mut(rfq_id) else {
                return AwardOutcome {
                    awarded: false,
                    winning_bid: None,
                };
            };
            if record.status.is_terminal() {
                return AwardOutcome {
                    awarded: record.status == AuctionStatus::Awarded,
                    winning_bid: record.winning_bid.clone(),
                };
            }
            let winner = if record.bids.len() >= self.min_bids_to_award {
                self.best_bid(record)
            } else {
                None
            };
            record.status = if winner.is_some() {
                AuctionStatus::Awarded
            } else {
                AuctionStatus::Expired
            };
            record.winning_bid = winner.clone();
            record.settled_at = Some(Utc::now());
            (
                AwardOutcome {
                    awarded: winner.is_some(),
                    winning_bid: winner,
                },
                record.session_id.clone(),
            )
        };

        if let Some(journal) = &self.journal {
            journal.try_emit(
                session_id,
                EventKind::AuctionAwarded,
                json!({
                    "rfq_id": rfq_id,
                    "awarded": outcome.awarded,
                    "winning_node_id": outcome
                        .winning_bid
                        .as_ref()
                        .map(|b| b.bidder_node_id.clone()),
                }),
            );
        }
        outcome
    }

    /// Cancel an auction that has not started evaluating yet.
    pub fn cancel(&self, rfq_id: &str) -> bool {
        let mut auctions = self.auctions.lock();
        match auctions.get_mut(rfq_id) {
            Some(record) if record.status.accepts_bids() => {
                record.status = AuctionStatus::Cancelled;
                record.settled_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Drop terminal auctions older than one hour.
    pub fn cleanup(&self) {
        self.cleanup_at(Utc::now());
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) {
        self.auctions.lock().retain(|_, record| {
            !(record.status.is_terminal()
                && record
                    .settled_at
                    .is_some_and(|at| now - at > TERMINAL_RETENTION))
        });
    }

    pub fn auction(&self, rfq_id: &str) -> Option<AuctionRecord> {
        self.auctions.lock().get(rfq_id).cloned()
    }
}

/// Score a bid in `[0, 1]` against the RFQ's constraints.
///
/// `0.4·trust + 0.2·latency + 0.2·cost + 0.2·capability_match`, with cost
/// and duration expressed as clamped, inverted ratios of the caps and
/// `capability_match = |offered ∩ required| / |required|` (1.0 when no
/// capabilities are required).
pub fn score_bid(bid: &Bid, rfq: &Rfq, trust: f64) -> f64 {
    let cost_score = if rfq.constraints.max_cost_usd > 0.0 {
        1.0 - (bid.estimated_cost_usd / rfq.constraints.max_cost_usd).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let latency_score = if rfq.constraints.max_duration_ms > 0 {
        1.0 - (bid.estimated_duration_ms as f64 / rfq.constraints.max_duration_ms as f64)
            .clamp(0.0, 1.0)
    } else {
        0.0
    };
    let capability_match = if rfq.required_capabilities.is_empty() {
        1.0
    } else {
        let offered = rfq
            .required_capabilities
            .intersection(&bid.capabilities_offered)
            .count();
        offered as f64 / rfq.required_capabilities.len() as f64
    };

    WEIGHT_TRUST * trust.clamp(0.0, 1.0)
        + WEIGHT_LATENCY * latency_score
        + WEIGHT_COST * cost_score
        + WEIGHT_CAPABILITIES * capability_match
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfq(max_cost: f64, max_duration: u64, caps: &[&str]) -> Rfq {
        Rfq {
            rfq_id: "r1".to_string(),
            task_text: "scan".to_string(),
            originator_node_id: "me".to_string(),
            bid_deadline: Utc::now() + Duration::seconds(5),
            constraints: TaskConstraints {
                max_cost_usd: max_cost,
                max_duration_ms: max_duration,
                ..TaskConstraints::default()
            },
            required_capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    fn bid(bidder: &str, cost: f64, duration: u64, caps: &[&str]) -> Bid {
        Bid {
            bid_id: Uuid::new_v4().to_string(),
            rfq_id: "r1".to_string(),
            bidder_node_id: bidder.to_string(),
            estimated_cost_usd: cost,
            estimated_duration_ms: duration,
            estimated_tokens: 1_000,
            capabilities_offered: caps.iter().map(|c| (*c).to_string()).collect(),
            round: 0,
            nonce: 42,
            expires_at: Utc::now() + Duration::seconds(30),
        }
    }

    #[test]
    fn scoring_prefers_cheap_fast_trusted_bidders() {
        let rfq = rfq(1.0, 60_000, &["read-file"]);
        let x = bid("x", 0.1, 5_000, &["read-file"]);
        let y = bid("y", 0.9, 50_000, &["read-file"]);

        let score_x = score_bid(&x, &rfq, 0.9);
        let score_y = score_bid(&y, &rfq, 0.6);
        assert!(score_x > score_y);
        assert!(score_x > 0.9);
        assert!(score_y < 0.55);
    }

    #[test]
    fn capability_match_is_partial_credit() {
        let rfq = rfq(1.0, 60_000, &["read-file", "shell"]);
        let half = bid("h", 0.5, 30_000, &["read-file"]);
        let none = bid("n", 0.5, 30_000, &["browser"]);
        let score_half = score_bid(&half, &rfq, 0.5);
        let score_none = score_bid(&none, &rfq, 0.5);
        assert!((score_half - score_none - 0.1).abs() < 1e-9);
    }
}
