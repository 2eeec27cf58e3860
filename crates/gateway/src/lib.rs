//! Gateway: the streaming relay and its HTTP surface.
//!
//! Lifecycle of a request:
//! 1. `POST /api/chat` validates the query, opens the session's channel and
//!    spawns a producer task
//! 2. The producer streams provider output into the channel as deltas
//! 3. `GET /api/stream/{id}` drains the channel as server-sent events, with
//!    heartbeats while idle, until the terminal `complete` or `error`
//!
//! Providers live in `chatrelay-agents`; conversation logs in
//! `chatrelay-sessions`.

pub mod error;
pub mod producer;
pub mod relay;
pub mod server;
pub mod state;

pub use {
    error::RelayError,
    producer::{ChatRequest, SubmitAccepted, submit},
    relay::{ChannelSender, DeltaTracker, RelayEvent, RelayOptions, RelayRegistry, RelayStream},
    server::{build_gateway_app, spawn_eviction_sweeper, start_gateway},
    state::GatewayState,
};
