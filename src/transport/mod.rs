//! Peer-to-peer wire protocol: HTTP/JSON request–reply.
//!
//! [`wire`] defines the envelopes, [`client`] the outbound side with
//! per-mode deadlines, and [`server`] the axum routes a node exposes.
//! Heartbeats are delivered at-least-once; task messages are best-effort
//! with receiver-side idempotency on `task_id`.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{DispatchMode, HttpPeerClient, PeerClient, TransportError};
pub use server::{SwarmApi, SwarmHandlers, router};
