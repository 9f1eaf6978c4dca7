//! Room/transport runtime tuning: heartbeat cadence, room size, and the
//! background cleanup sweep that catches rooms orphaned by ungraceful
//! client crashes (§10.5).

use super::defaults::{
    default_heartbeat_interval_secs, default_heartbeat_timeout_secs, default_history_capacity,
    default_inactive_room_timeout_secs, default_room_cleanup_interval_secs, default_room_size,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Default maximum players for a newly created room.
    pub room_size: u8,
    /// How often the transport sends its heartbeat `Ping` to each connection.
    pub heartbeat_interval_secs: u64,
    /// How long the transport waits for a `Pong` before destroying the socket.
    pub heartbeat_timeout_secs: u64,
    /// How often the room-cleanup sweep runs.
    pub room_cleanup_interval_secs: u64,
    /// How long a room may sit with no broadcast activity before the cleanup
    /// sweep removes it, independent of the per-connection heartbeat.
    pub inactive_room_timeout_secs: u64,
    /// Bounded history buffer length kept per room (`Room::messages`).
    pub history_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            room_size: default_room_size(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            room_cleanup_interval_secs: default_room_cleanup_interval_secs(),
            inactive_room_timeout_secs: default_inactive_room_timeout_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}
