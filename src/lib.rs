//! # Weavemesh: Delegation Safety Core for Agent Meshes
//!
//! Weavemesh is the coordinated subsystem that makes task delegation
//! between autonomous agent nodes safe in the face of slow, buggy, or
//! adversarial peers. Each node runs a planner/executor loop and may hand
//! off subtasks to peers; this crate decides whom to delegate to, what
//! authority to grant, how to verify the result, and how to attribute the
//! outcome.
//!
//! ## Core Concepts
//!
//! - **Journal**: Append-only hash-chained event log with crash recovery
//! - **Reputation**: Outcome-sourced trust scores in `[0, 1]`
//! - **Bonds**: Escrowed amounts held per delegation, slashed on violation
//! - **Contracts**: Per-delegation SLOs, tool allowlists, and monitoring
//! - **Gates**: Advisory friction plus a hard firebreak before dispatch
//! - **Mesh**: Peer membership, heartbeats, and sybil defense
//!
//! ## Quick Start
//!
//! ### Trust scoring
//!
//! ```
//! use weavemesh::reputation::{ReputationStore, TrustTier};
//!
//! let store = ReputationStore::in_memory();
//! // Unknown peers get a neutral prior.
//! assert_eq!(store.trust_score("peer-1"), 0.5);
//! assert_eq!(TrustTier::from_trust(0.95), TrustTier::Elite);
//! ```
//!
//! ### Proof-of-work membership challenges
//!
//! ```
//! use weavemesh::sybil::PowChallenge;
//!
//! let challenge = PowChallenge::generate(1);
//! let solution = challenge.solve();
//! assert!(challenge.verify(&solution));
//! ```
//!
//! ### Configuration
//!
//! ```
//! use weavemesh::config::MeshConfig;
//!
//! let config = MeshConfig::default().with_slo_strict(false);
//! assert_eq!(config.max_redelegations, 3);
//! ```
//!
//! ## One delegation, end to end
//!
//! decomposer → router → friction/firebreak gate → authority tier → bond
//! hold → transport dispatch → remote execution → result delivery →
//! outcome verifier → anomaly detector → consensus → escrow release or
//! slash → reputation update → optional re-delegation → checkpoint.
//! [`pipeline::CoreServices`] wires that chain; every stage reads and
//! writes an explicit per-delegation context rather than shared globals.
//!
//! ## Module Guide
//!
//! - [`journal`] - Hash-chained event log, redaction, recovery, compaction
//! - [`reputation`] - Per-peer outcome counters and derived trust
//! - [`escrow`] - Balances, per-task bonds, slash/release
//! - [`checkpoint`] - Durable per-task checkpoints (FIFO capped)
//! - [`contract`] - Delegation contracts and graduated authority
//! - [`verifier`] - SLO outcome checks and consensus rounds
//! - [`friction`], [`firebreak`], [`router`] - Pre-dispatch gates
//! - [`anomaly`], [`behavior`], [`rootcause`] - Post-hoc analysis
//! - [`redelegation`] - Retry chains with hop caps and cooldowns
//! - [`sybil`] - Coordinated-join detection and proof-of-work
//! - [`mesh`] - Identity, peer table, heartbeat, lifecycle FSM
//! - [`transport`] - HTTP/JSON wire protocol between peers
//! - [`auction`] - RFQ broadcast, bid scoring, award
//! - [`decompose`] - Task splitting and attribute analysis
//! - [`pipeline`] - The orchestration that ties it all together

pub mod anomaly;
pub mod auction;
pub mod behavior;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod decompose;
pub mod escrow;
pub mod firebreak;
pub mod friction;
pub mod journal;
pub mod mesh;
pub mod pipeline;
pub mod redelegation;
pub mod reputation;
pub mod rootcause;
pub mod router;
pub mod sybil;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod verifier;
