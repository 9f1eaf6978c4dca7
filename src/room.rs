//! Room state machine data model: users, scores, room membership, and the
//! in-memory catalog (`RoomStore`) that owns every room.
//!
//! Lock ordering: callers that need both the session table and a room must
//! acquire `SessionTable` before `RoomStore` (see `crate::session`), and must
//! release `RoomStore` before making any outbound HTTP call (chart fetch,
//! record fetch, federation proxy) — re-acquiring afterward to commit.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Reserved user id for the synthetic server bot injected into every room.
pub const SERVER_BOT_USER_ID: i32 = -1;

/// Sentinel connection id for the server bot's `PlayerInfo` — never handed
/// out by `ConnectionRegistry::next_connection_id` (a real counter starting
/// at 0) nor by federation's virtual-connection scheme (high bit set, but
/// this value is never registered anywhere `Outbox::send` would look it
/// up), so sends addressed to it are harmlessly dropped as "unknown
/// connection".
const BOT_CONNECTION_ID: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i32,
    pub name: String,
    pub monitor: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerScore {
    pub score: i32,
    pub accuracy: f32,
    pub perfect: i32,
    pub good: i32,
    pub bad: i32,
    pub miss: i32,
    pub max_combo: i32,
    pub finish_time: i64,
}

impl PlayerScore {
    #[must_use]
    pub fn full_combo(&self) -> bool {
        self.miss == 0 && self.bad == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub user: UserInfo,
    pub connection_id: u64,
    pub is_ready: bool,
    pub is_finished: bool,
    pub score: Option<PlayerScore>,
    /// Monotonic join order, used to pick the next owner in cycle mode and
    /// when electing a new owner after the current one leaves.
    pub joined_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomState {
    SelectChart { chart_id: Option<i32> },
    WaitingForReady,
    Playing,
}

impl RoomState {
    /// Short label used in federation room summaries and the web bridge's
    /// JSON catalog, where the wire's internally-tagged enum shape would be
    /// noisier than callers need.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::SelectChart { .. } => "select_chart",
            Self::WaitingForReady => "waiting_for_ready",
            Self::Playing => "playing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: u32,
    pub user_id: i32,
    pub score: Option<PlayerScore>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room not found")]
    NotFound,
    #[error("room is full")]
    Full,
    #[error("room is locked")]
    Locked,
    #[error("not whitelisted")]
    NotWhitelisted,
    #[error("blacklisted")]
    Blacklisted,
    #[error("a room with this id already exists")]
    AlreadyExists,
    #[error("not the room owner")]
    NotOwner,
    #[error("not in this room")]
    NotInRoom,
    #[error("already in another room")]
    AlreadyInRoom,
    #[error("wrong room state for this action")]
    WrongState,
    #[error("a chart must be selected first")]
    NoChartSelected,
    #[error("not enough players to start")]
    NotEnoughPlayers,
    #[error("player is not ready")]
    NotReady,
    #[error("maximum number of rooms reached")]
    MaxRoomsReached,
}

/// A live room: membership, chart selection, broadcast history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub owner_id: i32,
    pub players: HashMap<i32, PlayerInfo>,
    pub max_players: u8,
    pub state: RoomState,
    pub locked: bool,
    pub cycle: bool,
    pub live: bool,
    pub selected_chart: Option<i32>,
    pub last_game_chart: Option<i32>,
    pub messages: Vec<super::codec::server::Message>,
    pub blacklist: Vec<i32>,
    pub whitelist: Vec<i32>,
    pub created_at: i64,
    /// Two-phase gate for solo `RequestStart`: the first request only
    /// arms the flag, the second actually starts the game.
    pub solo_confirm_pending: bool,
    next_join_seq: u64,
}

const MAX_HISTORY: usize = 200;

impl Room {
    #[must_use]
    pub fn new(id: String, owner: UserInfo, connection_id: u64, max_players: u8, now_ms: i64) -> Self {
        let mut players = HashMap::new();
        let owner_id = owner.id;
        players.insert(
            owner_id,
            PlayerInfo {
                user: owner,
                connection_id,
                is_ready: false,
                is_finished: false,
                score: None,
                joined_at: 0,
            },
        );
        players.insert(
            SERVER_BOT_USER_ID,
            PlayerInfo {
                user: UserInfo { id: SERVER_BOT_USER_ID, name: "Server".to_string(), monitor: true },
                connection_id: BOT_CONNECTION_ID,
                is_ready: true,
                is_finished: true,
                score: None,
                joined_at: u64::MAX,
            },
        );
        Self {
            id,
            owner_id,
            players,
            max_players,
            state: RoomState::SelectChart { chart_id: None },
            locked: false,
            cycle: false,
            live: false,
            selected_chart: None,
            last_game_chart: None,
            messages: Vec::new(),
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            created_at: now_ms,
            solo_confirm_pending: false,
            next_join_seq: 1,
        }
    }

    #[must_use]
    pub fn non_monitor_player_ids_in_join_order(&self) -> Vec<i32> {
        let mut players: Vec<_> = self
            .players
            .values()
            .filter(|p| !p.user.monitor && p.user.id != SERVER_BOT_USER_ID)
            .collect();
        players.sort_by_key(|p| p.joined_at);
        players.into_iter().map(|p| p.user.id).collect()
    }

    #[must_use]
    pub fn active_player_count(&self) -> usize {
        self.non_monitor_player_ids_in_join_order().len()
    }

    pub fn record_message(&mut self, msg: super::codec::server::Message) {
        self.messages.push(msg);
        if self.messages.len() > MAX_HISTORY {
            let overflow = self.messages.len() - MAX_HISTORY;
            self.messages.drain(0..overflow);
        }
    }

    pub fn can_join(&self, user_id: i32) -> Result<(), RoomError> {
        if self.blacklist.contains(&user_id) {
            return Err(RoomError::Blacklisted);
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&user_id) {
            return Err(RoomError::NotWhitelisted);
        }
        if self.locked {
            return Err(RoomError::Locked);
        }
        if self.real_player_count() >= self.max_players as usize {
            return Err(RoomError::Full);
        }
        Ok(())
    }

    /// Member count excluding the synthetic server bot — what `max_players`
    /// actually gates.
    #[must_use]
    pub fn real_player_count(&self) -> usize {
        self.players.len() - usize::from(self.players.contains_key(&SERVER_BOT_USER_ID))
    }

    pub fn add_player(&mut self, user: UserInfo, connection_id: u64) {
        let seq = self.next_join_seq;
        self.next_join_seq += 1;
        self.players.insert(
            user.id,
            PlayerInfo {
                user,
                connection_id,
                is_ready: false,
                is_finished: false,
                score: None,
                joined_at: seq,
            },
        );
    }

    /// Removes a player. If they were the owner, elects the next owner from
    /// the remaining non-monitor members in join order and returns the new
    /// owner id. Returns `true` in the second element if the room is now
    /// empty and should be deleted by the caller.
    pub fn remove_player(&mut self, user_id: i32) -> (Option<i32>, bool) {
        self.players.remove(&user_id);
        // The server bot and any monitors don't keep a room alive on their
        // own (§3 lifetimes: "a solo monitor does not keep a room alive
        // beyond its owner").
        if self.active_player_count() == 0 {
            return (None, true);
        }
        if self.owner_id != user_id {
            return (None, false);
        }
        let candidates = self.non_monitor_player_ids_in_join_order();
        let new_owner = candidates[0];
        self.owner_id = new_owner;
        (Some(new_owner), false)
    }

    #[must_use]
    pub fn is_owner(&self, user_id: i32) -> bool {
        self.owner_id == user_id
    }

    /// Computes game-end rankings: non-monitor players sorted by score
    /// descending, `None` scores sort to the bottom, ranks are 1-based.
    #[must_use]
    pub fn compute_rankings(&self) -> Vec<RankingEntry> {
        let mut ids = self.non_monitor_player_ids_in_join_order();
        ids.sort_by(|a, b| {
            let sa = self.players.get(a).and_then(|p| p.score);
            let sb = self.players.get(b).and_then(|p| p.score);
            match (sa, sb) {
                (Some(a), Some(b)) => b.score.cmp(&a.score),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
        ids.into_iter()
            .enumerate()
            .map(|(idx, user_id)| RankingEntry {
                rank: (idx + 1) as u32,
                user_id,
                score: self.players.get(&user_id).and_then(|p| p.score),
            })
            .collect()
    }

    /// Rotates ownership to the next non-monitor member after `current` in
    /// join order, wrapping around. Used by cycle mode at game end.
    #[must_use]
    pub fn next_owner_for_cycle(&self, current: i32) -> Option<i32> {
        let ids = self.non_monitor_player_ids_in_join_order();
        if ids.is_empty() {
            return None;
        }
        let pos = ids.iter().position(|&id| id == current);
        match pos {
            Some(idx) => Some(ids[(idx + 1) % ids.len()]),
            None => ids.first().copied(),
        }
    }

    pub fn reset_for_next_round(&mut self) {
        for player in self.players.values_mut() {
            player.is_ready = false;
            player.is_finished = false;
        }
    }
}

/// The in-memory catalog of all live rooms plus the `userId -> roomId`
/// reverse index that keeps "a player is in at most one room" enforceable
/// in O(1).
#[derive(Default)]
pub struct RoomStore {
    rooms: RwLock<HashMap<String, Room>>,
    by_user: RwLock<HashMap<i32, String>>,
}

impl RoomStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn room_of_user(&self, user_id: i32) -> Option<String> {
        self.by_user.read().await.get(&user_id).cloned()
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn exists(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Runs `f` against the room under the write lock, persisting whatever
    /// mutation it performs. Returns `f`'s return value. If `f` empties the
    /// room's player map, the room and its reverse-index entries are
    /// removed automatically.
    pub async fn mutate<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> T,
    ) -> Result<T, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;
        let result = f(room);
        let empty = room.active_player_count() == 0;
        if empty {
            rooms.remove(room_id);
        }
        drop(rooms);
        result_cleanup_index(self, room_id, empty).await;
        Ok(result)
    }

    pub async fn create(
        &self,
        id: String,
        owner: UserInfo,
        connection_id: u64,
        max_players: u8,
        now_ms: i64,
    ) -> Result<(), RoomError> {
        if self.by_user.read().await.contains_key(&owner.id) {
            return Err(RoomError::AlreadyInRoom);
        }
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&id) {
            return Err(RoomError::AlreadyExists);
        }
        let room = Room::new(id.clone(), owner.clone(), connection_id, max_players, now_ms);
        rooms.insert(id.clone(), room);
        drop(rooms);
        self.by_user.write().await.insert(owner.id, id);
        Ok(())
    }

    pub async fn join(
        &self,
        room_id: &str,
        user: UserInfo,
        connection_id: u64,
    ) -> Result<(), RoomError> {
        if self.by_user.read().await.contains_key(&user.id) {
            return Err(RoomError::AlreadyInRoom);
        }
        let mut rooms = self.rooms.write().await;
        let room = rooms.get_mut(room_id).ok_or(RoomError::NotFound)?;
        room.can_join(user.id)?;
        let user_id = user.id;
        room.add_player(user, connection_id);
        drop(rooms);
        self.by_user.write().await.insert(user_id, room_id.to_string());
        Ok(())
    }

    /// Removes the user from whatever room they're in (no-op if none),
    /// returning the room id they left and the new owner id if ownership
    /// changed, plus whether the room was deleted.
    pub async fn leave(&self, user_id: i32) -> Option<(String, Option<i32>, bool)> {
        let room_id = self.by_user.write().await.remove(&user_id)?;
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return Some((room_id, None, true));
        };
        let (new_owner, deleted) = room.remove_player(user_id);
        if deleted {
            rooms.remove(&room_id);
        }
        Some((room_id, new_owner, deleted))
    }

    /// Migrates a player's `connectionId` in place without running the leave
    /// path — used by `SessionTable::authenticate` reconnection migration.
    pub async fn migrate_connection(&self, user_id: i32, new_connection_id: u64) {
        let Some(room_id) = self.by_user.read().await.get(&user_id).cloned() else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&room_id) {
            if let Some(player) = room.players.get_mut(&user_id) {
                player.connection_id = new_connection_id;
            }
        }
    }

    /// Removes rooms with no real (non-monitor) players left that have sat
    /// past `max_age_ms` since creation. A room normally disappears the
    /// moment its last player leaves (`mutate`/`leave`); this only catches
    /// rooms abandoned by monitors or left in a monitor-only state without a
    /// clean leave. Returns the ids removed.
    pub async fn sweep_inactive(&self, max_age_ms: i64, now_ms: i64) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let stale: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| room.active_player_count() == 0 && now_ms - room.created_at >= max_age_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            rooms.remove(id);
        }
        drop(rooms);
        if !stale.is_empty() {
            let mut by_user = self.by_user.write().await;
            by_user.retain(|_, room_id| !stale.contains(room_id));
        }
        stale
    }
}

async fn result_cleanup_index(store: &RoomStore, room_id: &str, emptied: bool) {
    if !emptied {
        return;
    }
    let mut by_user = store.by_user.write().await;
    by_user.retain(|_, v| v != room_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i32, monitor: bool) -> UserInfo {
        UserInfo { id, name: format!("u{id}"), monitor }
    }

    #[tokio::test]
    async fn owner_always_in_players_and_election_runs_on_leave() {
        let store = RoomStore::new();
        store.create("r1".into(), user(1, false), 100, 8, 0).await.unwrap();
        store.join("r1", user(2, false), 101).await.unwrap();
        store.join("r1", user(3, false), 102).await.unwrap();

        let (room_id, new_owner, deleted) = store.leave(1).await.unwrap();
        assert_eq!(room_id, "r1");
        assert_eq!(new_owner, Some(2));
        assert!(!deleted);

        let room = store.get("r1").await.unwrap();
        assert!(room.players.contains_key(&room.owner_id));
        assert_eq!(room.owner_id, 2);
    }

    #[tokio::test]
    async fn room_deleted_when_last_player_leaves() {
        let store = RoomStore::new();
        store.create("r1".into(), user(1, false), 100, 8, 0).await.unwrap();
        let (_, _, deleted) = store.leave(1).await.unwrap();
        assert!(deleted);
        assert!(!store.exists("r1").await);
    }

    #[tokio::test]
    async fn player_can_only_be_in_one_room() {
        let store = RoomStore::new();
        store.create("r1".into(), user(1, false), 100, 8, 0).await.unwrap();
        let err = store.create("r2".into(), user(1, false), 100, 8, 0).await.unwrap_err();
        assert_eq!(err, RoomError::AlreadyInRoom);
    }

    #[tokio::test]
    async fn blacklist_wins_over_whitelist() {
        let store = RoomStore::new();
        store.create("r1".into(), user(1, false), 100, 8, 0).await.unwrap();
        store
            .mutate("r1", |r| {
                r.whitelist.push(2);
                r.blacklist.push(2);
            })
            .await
            .unwrap();
        let err = store.join("r1", user(2, false), 101).await.unwrap_err();
        assert_eq!(err, RoomError::Blacklisted);
    }

    #[test]
    fn rankings_sort_descending_with_none_at_bottom() {
        let mut room = Room::new("r".into(), user(1, false), 1, 8, 0);
        room.add_player(user(2, false), 2);
        room.add_player(user(3, false), 3);
        room.players.get_mut(&1).unwrap().score = Some(PlayerScore {
            score: 500, accuracy: 90.0, perfect: 1, good: 1, bad: 0, miss: 0, max_combo: 1, finish_time: 0,
        });
        room.players.get_mut(&2).unwrap().score = Some(PlayerScore {
            score: 900, accuracy: 99.0, perfect: 1, good: 0, bad: 0, miss: 0, max_combo: 1, finish_time: 0,
        });
        // player 3 never finished: score stays None.
        let rankings = room.compute_rankings();
        assert_eq!(rankings[0].user_id, 2);
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].user_id, 1);
        assert_eq!(rankings[2].user_id, 3);
        assert!(rankings[2].score.is_none());
    }

    #[test]
    fn cycle_rotation_wraps_around() {
        let mut room = Room::new("r".into(), user(1, false), 1, 8, 0);
        room.add_player(user(2, false), 2);
        room.add_player(user(3, false), 3);
        assert_eq!(room.next_owner_for_cycle(1), Some(2));
        assert_eq!(room.next_owner_for_cycle(3), Some(1));
    }
}
