//! Process-wide counters exposed for operational visibility (§10.1). No
//! external metrics backend is wired up; `MetricsSnapshot` is what the web
//! bridge's `/admin/metrics` endpoint serializes to JSON.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub disconnections: AtomicU64,
    pub connection_errors: AtomicU64,
    pub frames_dropped: AtomicU64,

    pub rooms_created: AtomicU64,
    pub rooms_joined: AtomicU64,
    pub room_creation_failures: AtomicU64,
    pub room_join_failures: AtomicU64,
    pub rooms_deleted: AtomicU64,

    pub retry_attempts: AtomicU64,
    pub retry_successes: AtomicU64,

    pub federation_messages_sent: AtomicU64,
    pub federation_messages_received: AtomicU64,
    pub federation_handshake_failures: AtomicU64,
    pub federation_proxy_errors: AtomicU64,

    pub players_joined: AtomicU64,
    pub players_left: AtomicU64,
    pub owner_transfers: AtomicU64,
    pub games_completed: AtomicU64,

    pub validation_errors: AtomicU64,
    pub internal_errors: AtomicU64,
    pub protocol_errors: AtomicU64,

    pub empty_rooms_cleaned: AtomicU64,
    pub stale_peers_cleaned: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub connections: ConnectionMetrics,
    pub rooms: RoomMetrics,
    pub retry: RetryMetrics,
    pub federation: FederationMetrics,
    pub players: PlayerMetrics,
    pub errors: ErrorMetrics,
    pub cleanup: CleanupMetrics,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionMetrics {
    pub total_connections: u64,
    pub active_connections: u64,
    pub disconnections: u64,
    pub connection_errors: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RoomMetrics {
    pub rooms_created: u64,
    pub rooms_joined: u64,
    pub room_creation_failures: u64,
    pub room_join_failures: u64,
    pub rooms_deleted: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryMetrics {
    pub retry_attempts: u64,
    pub retry_successes: u64,
    pub retry_success_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FederationMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub handshake_failures: u64,
    pub proxy_errors: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlayerMetrics {
    pub players_joined: u64,
    pub players_left: u64,
    pub owner_transfers: u64,
    pub games_completed: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorMetrics {
    pub validation_errors: u64,
    pub internal_errors: u64,
    pub protocol_errors: u64,
    pub total_errors: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanupMetrics {
    pub empty_rooms_cleaned: u64,
    pub stale_peers_cleaned: u64,
}

impl ServerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connection_errors(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rooms_created(&self) {
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rooms_joined(&self) {
        self.rooms_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_room_creation_failures(&self) {
        self.room_creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_room_join_failures(&self) {
        self.room_join_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rooms_deleted(&self) {
        self.rooms_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_attempts(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_successes(&self) {
        self.retry_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_federation_sent(&self) {
        self.federation_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_federation_received(&self) {
        self.federation_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_federation_handshake_failures(&self) {
        self.federation_handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_federation_proxy_errors(&self) {
        self.federation_proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_players_joined(&self) {
        self.players_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_players_left(&self) {
        self.players_left.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_owner_transfers(&self) {
        self.owner_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_games_completed(&self) {
        self.games_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_validation_errors(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_internal_errors(&self) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_empty_rooms_cleaned(&self) {
        self.empty_rooms_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale_peers_cleaned(&self) {
        self.stale_peers_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let retry_attempts = self.retry_attempts.load(Ordering::Relaxed);
        let retry_successes = self.retry_successes.load(Ordering::Relaxed);
        let retry_success_rate = if retry_attempts == 0 {
            0.0
        } else {
            retry_successes as f64 / retry_attempts as f64
        };
        let validation_errors = self.validation_errors.load(Ordering::Relaxed);
        let internal_errors = self.internal_errors.load(Ordering::Relaxed);
        let protocol_errors = self.protocol_errors.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: chrono::Utc::now(),
            connections: ConnectionMetrics {
                total_connections: self.total_connections.load(Ordering::Relaxed),
                active_connections: self.active_connections.load(Ordering::Relaxed),
                disconnections: self.disconnections.load(Ordering::Relaxed),
                connection_errors: self.connection_errors.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            rooms: RoomMetrics {
                rooms_created: self.rooms_created.load(Ordering::Relaxed),
                rooms_joined: self.rooms_joined.load(Ordering::Relaxed),
                room_creation_failures: self.room_creation_failures.load(Ordering::Relaxed),
                room_join_failures: self.room_join_failures.load(Ordering::Relaxed),
                rooms_deleted: self.rooms_deleted.load(Ordering::Relaxed),
            },
            retry: RetryMetrics { retry_attempts, retry_successes, retry_success_rate },
            federation: FederationMetrics {
                messages_sent: self.federation_messages_sent.load(Ordering::Relaxed),
                messages_received: self.federation_messages_received.load(Ordering::Relaxed),
                handshake_failures: self.federation_handshake_failures.load(Ordering::Relaxed),
                proxy_errors: self.federation_proxy_errors.load(Ordering::Relaxed),
            },
            players: PlayerMetrics {
                players_joined: self.players_joined.load(Ordering::Relaxed),
                players_left: self.players_left.load(Ordering::Relaxed),
                owner_transfers: self.owner_transfers.load(Ordering::Relaxed),
                games_completed: self.games_completed.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                validation_errors,
                internal_errors,
                protocol_errors,
                total_errors: validation_errors + internal_errors + protocol_errors,
            },
            cleanup: CleanupMetrics {
                empty_rooms_cleaned: self.empty_rooms_cleaned.load(Ordering::Relaxed),
                stale_peers_cleaned: self.stale_peers_cleaned.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_success_rate_computed_from_counters() {
        let metrics = ServerMetrics::new();
        metrics.increment_retry_attempts();
        metrics.increment_retry_attempts();
        metrics.increment_retry_successes();
        let snap = metrics.snapshot();
        assert_eq!(snap.retry.retry_attempts, 2);
        assert_eq!(snap.retry.retry_successes, 1);
        assert!((snap.retry.retry_success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn active_connections_does_not_underflow() {
        let metrics = ServerMetrics::new();
        metrics.decrement_active_connections();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
    }
}
