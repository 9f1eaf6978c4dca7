//! Connection <-> user session bookkeeping (§4.3).
//!
//! `SessionTable` is always locked before `RoomStore` (see `crate::room`
//! module doc) to keep the fixed Session -> Room -> Federation acquisition
//! order from §5.

use crate::auth_client::AuthClient;
use crate::ban_store::BanStore;
use crate::errors::ProtocolError;
use crate::room::{RoomStore, UserInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: i32,
    pub user_info: UserInfo,
    pub connection_id: u64,
    pub remote_addr: SocketAddr,
}

/// Result of a successful `authenticate()` call, used by the protocol
/// engine to decide what else to broadcast.
pub struct AuthOutcome {
    pub user_info: UserInfo,
    /// Set when an existing session for this user was migrated onto the
    /// new connection rather than created fresh (§4.3 point 5 / scenario S5).
    pub migrated_from_room: Option<String>,
    /// Connection id of a stale session that should be closed silently
    /// (no `LeaveRoom` emitted) because this authentication migrated onto it.
    pub evict_connection_id: Option<u64>,
    /// Whether the evicted connection should run the full disconnect path
    /// (true) or be closed silently because its room membership migrated
    /// (false).
    pub evict_is_full_disconnect: bool,
}

#[derive(Default)]
pub struct SessionTable {
    by_conn: RwLock<HashMap<u64, Session>>,
    by_user: RwLock<HashMap<i32, u64>>,
}

/// Required length of an authentication token, in characters. The legacy
/// implementation this was modeled on validated 32 characters in some
/// revisions and 20 in others; §9's resolved open question adopts 20 as the
/// default, exposed through `auth.token_length` in configuration.
pub const DEFAULT_TOKEN_LENGTH: usize = 20;

impl SessionTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_connection(&self, _connection_id: u64) {
        // Unauthenticated connections hold no session row; this hook exists
        // so transport can log connection lifecycle symmetrically with
        // `remove_connection` without special-casing "not yet authed".
    }

    pub async fn get(&self, connection_id: u64) -> Option<Session> {
        self.by_conn.read().await.get(&connection_id).cloned()
    }

    pub async fn get_by_user(&self, user_id: i32) -> Option<Session> {
        let conn_id = *self.by_user.read().await.get(&user_id)?;
        self.by_conn.read().await.get(&conn_id).cloned()
    }

    pub async fn remove_connection(&self, connection_id: u64) -> Option<Session> {
        let session = self.by_conn.write().await.remove(&connection_id)?;
        let mut by_user = self.by_user.write().await;
        if by_user.get(&session.user_id) == Some(&connection_id) {
            by_user.remove(&session.user_id);
        }
        Some(session)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn authenticate(
        &self,
        connection_id: u64,
        remote_addr: SocketAddr,
        token: &str,
        token_length: usize,
        auth_client: &dyn AuthClient,
        ban_store: &dyn BanStore,
        rooms: &RoomStore,
    ) -> Result<AuthOutcome, ProtocolError> {
        if self.by_conn.read().await.contains_key(&connection_id) {
            return Err(ProtocolError::DuplicateAuth);
        }
        if token.chars().count() != token_length {
            return Err(ProtocolError::InvalidToken);
        }

        if let Some(reason) = ban_store.ban_reason_for_ip(&remote_addr.ip().to_string()).await {
            return Err(ProtocolError::Banned(reason));
        }

        let user_info = auth_client
            .authenticate(token)
            .await
            .map_err(ProtocolError::AuthUpstreamFailure)?;

        if let Some(reason) = ban_store.ban_reason_for_id(user_info.id).await {
            return Err(ProtocolError::Banned(reason));
        }

        let mut evict_connection_id = None;
        let mut evict_is_full_disconnect = false;
        let mut migrated_from_room = None;

        let existing_conn = self.by_user.read().await.get(&user_info.id).copied();
        if let Some(old_conn_id) = existing_conn {
            if old_conn_id != connection_id {
                if let Some(room_id) = rooms.room_of_user(user_info.id).await {
                    rooms.migrate_connection(user_info.id, connection_id).await;
                    migrated_from_room = Some(room_id);
                    evict_connection_id = Some(old_conn_id);
                    evict_is_full_disconnect = false;
                } else {
                    evict_connection_id = Some(old_conn_id);
                    evict_is_full_disconnect = true;
                }
                self.by_conn.write().await.remove(&old_conn_id);
            }
        }

        let session = Session {
            user_id: user_info.id,
            user_info: user_info.clone(),
            connection_id,
            remote_addr,
        };
        self.by_conn.write().await.insert(connection_id, session);
        self.by_user.write().await.insert(user_info.id, connection_id);

        Ok(AuthOutcome {
            user_info,
            migrated_from_room,
            evict_connection_id,
            evict_is_full_disconnect,
        })
    }

    pub async fn len(&self) -> usize {
        self.by_conn.read().await.len()
    }

    /// Registers a session for a virtual connection id backing a cross-node
    /// federated proxy player (§4.5): the remote user was already
    /// authenticated on its home node, so this bypasses `AuthClient`/`BanStore`
    /// entirely and just commits the session row.
    pub async fn register_federated(
        &self,
        connection_id: u64,
        user_info: UserInfo,
        remote_addr: SocketAddr,
    ) {
        let session = Session {
            user_id: user_info.id,
            user_info,
            connection_id,
            remote_addr,
        };
        self.by_conn.write().await.insert(connection_id, session.clone());
        self.by_user.write().await.insert(session.user_id, connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_client::StaticAuthClient;
    use crate::ban_store::InMemoryBanStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[tokio::test]
    async fn duplicate_auth_on_same_connection_rejected() {
        let sessions = SessionTable::new();
        let rooms = RoomStore::new();
        let auth = StaticAuthClient::single(1, "player-one");
        let bans = InMemoryBanStore::default();
        let token = "a".repeat(DEFAULT_TOKEN_LENGTH);

        sessions
            .authenticate(1, addr(), &token, DEFAULT_TOKEN_LENGTH, &auth, &bans, &rooms)
            .await
            .unwrap();
        let err = sessions
            .authenticate(1, addr(), &token, DEFAULT_TOKEN_LENGTH, &auth, &bans, &rooms)
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateAuth);
    }

    #[tokio::test]
    async fn reconnect_migrates_room_membership_without_leave() {
        let sessions = SessionTable::new();
        let rooms = RoomStore::new();
        let auth = StaticAuthClient::single(1, "player-one");
        let bans = InMemoryBanStore::default();
        let token = "a".repeat(DEFAULT_TOKEN_LENGTH);

        sessions
            .authenticate(1, addr(), &token, DEFAULT_TOKEN_LENGTH, &auth, &bans, &rooms)
            .await
            .unwrap();
        rooms
            .create("r1".into(), UserInfo { id: 1, name: "player-one".into(), monitor: false }, 1, 8, 0)
            .await
            .unwrap();

        let outcome = sessions
            .authenticate(2, addr(), &token, DEFAULT_TOKEN_LENGTH, &auth, &bans, &rooms)
            .await
            .unwrap();

        assert_eq!(outcome.migrated_from_room.as_deref(), Some("r1"));
        assert_eq!(outcome.evict_connection_id, Some(1));
        assert!(!outcome.evict_is_full_disconnect);

        let room = rooms.get("r1").await.unwrap();
        assert_eq!(room.players[&1].connection_id, 2);
    }
}
