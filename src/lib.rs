#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::similar_names
)]

//! # phi-session-server
//!
//! A multiplayer rhythm-game session server: room lifecycle, the
//! chart-select/ready/play state machine, cross-node federation, and a
//! read-only web bridge for spectators and admins.

/// Upstream account-token exchange.
pub mod auth_client;

/// Ban list lookups.
pub mod ban_store;

/// Outbound broadcast batching and fan-out.
pub mod broadcast;

/// Chart metadata lookups.
pub mod chart_service;

/// Binary wire protocol: framing and command encode/decode.
pub mod codec;

/// Server configuration and environment variables.
pub mod config;

/// Top-level error taxonomy.
pub mod errors;

/// Cross-node federation: handshake, health checks, gossip, proxying.
pub mod federation;

/// Structured logging configuration.
pub mod logging;

/// Metrics collection and reporting.
pub mod metrics;

/// Command dispatch and the room state machine.
pub mod protocol_engine;

/// Retry logic utilities.
pub mod retry;

/// Room state machine data model and in-memory catalog.
pub mod room;

/// Crypto utilities (envelope encryption, admin secret tokens).
pub mod security;

/// Connection <-> user session bookkeeping.
pub mod session;

/// TCP transport: framing over the wire, heartbeats, connection lifecycle.
pub mod transport;

/// Read-only HTTP/WebSocket bridge for spectators and admins.
pub mod web;
