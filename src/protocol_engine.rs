//! Command dispatch and the room state machine (§4.4).
//!
//! Every handler resolves the caller's [`crate::session::Session`] first
//! (`not-authenticated` if absent), then — where the command needs one — the
//! caller's room (`not-in-room` if absent), mirroring the dispatch shape of
//! the teacher's `server/message_router.rs` and the small, one-handler-per-
//! command style of `server/ready_state.rs`. Locks are released before any
//! outbound HTTP call (chart/record fetch) per §5, re-acquired to commit the
//! result.

use crate::auth_client::AuthClient;
use crate::ban_store::BanStore;
use crate::broadcast::BroadcastMessage;
use crate::chart_service::ChartService;
use crate::codec::client::ClientCommand;
use crate::codec::server::{ClientRoomState, GameEndSummary, Message, ServerCommand};
use crate::errors::ProtocolError;
use crate::metrics::ServerMetrics;
use crate::room::{PlayerScore, Room, RoomError, RoomState, RoomStore, UserInfo};
use crate::session::SessionTable;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delivers an encoded server command frame to one connection. Implemented
/// by the transport's connection registry; kept as a trait so the engine
/// never depends on socket or channel types directly.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, connection_id: u64, frame: Bytes);

    /// Forcibly terminates a connection (admin kick, ban enforcement). A
    /// no-op if the connection is already gone.
    async fn close(&self, connection_id: u64);
}

/// The narrow callback surface federation calls back into the engine
/// through, injected after construction to avoid a compile-time cycle
/// between `federation` and `protocol_engine` (§9 design note).
#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn handle_message(&self, connection_id: u64, cmd: ClientCommand);
    async fn handle_disconnection(&self, connection_id: u64);
    async fn send_command_to_user(&self, user_id: i32, cmd: ServerCommand);
    async fn create_federated_session(
        &self,
        connection_id: u64,
        user: UserInfo,
        remote_addr: SocketAddr,
    );
}

/// The engine's half of the cross-node proxy (§4.5): lets federation take
/// over a connection that belongs to a room hosted on another node, and
/// claim rooms the local catalog doesn't know about. Injected after
/// construction for the same reason as `EngineHandle`.
#[async_trait]
pub trait FederationRouter: Send + Sync {
    /// If `connection_id` is currently bridged to a room on another node,
    /// forwards `cmd` there and returns `true`. Returns `false` to let the
    /// engine handle the command against the local room catalog as usual.
    async fn forward_if_remote(&self, connection_id: u64, cmd: &ClientCommand) -> bool;

    /// Called when a local `JoinRoom` misses the local catalog entirely.
    /// Returns `Some(())` once it has taken over the join (including
    /// sending the wire reply), or `None` if no peer claims this room
    /// either — the engine then reports the ordinary `room-not-found`.
    async fn try_join_remote_room(
        &self,
        connection_id: u64,
        user: UserInfo,
        room_id: String,
        monitor: bool,
    ) -> Option<()>;
}

pub struct ProtocolEngine {
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomStore>,
    auth_client: Arc<dyn AuthClient>,
    chart_service: Arc<dyn ChartService>,
    ban_store: Arc<dyn BanStore>,
    metrics: Arc<ServerMetrics>,
    outbox: Arc<dyn Outbox>,
    token_length: usize,
    max_room_players: u8,
    federation_router: tokio::sync::RwLock<Option<Arc<dyn FederationRouter>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ProtocolEngine {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionTable>,
        rooms: Arc<RoomStore>,
        auth_client: Arc<dyn AuthClient>,
        chart_service: Arc<dyn ChartService>,
        ban_store: Arc<dyn BanStore>,
        metrics: Arc<ServerMetrics>,
        outbox: Arc<dyn Outbox>,
        token_length: usize,
        max_room_players: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            rooms,
            auth_client,
            chart_service,
            ban_store,
            metrics,
            outbox,
            token_length,
            max_room_players,
            federation_router: tokio::sync::RwLock::new(None),
        })
    }

    /// Wires the federation proxy in after construction (see
    /// `FederationRouter` doc) — main.rs calls this once both collaborators
    /// exist.
    pub async fn set_federation_router(&self, router: Arc<dyn FederationRouter>) {
        *self.federation_router.write().await = Some(router);
    }

    async fn send(&self, connection_id: u64, cmd: ServerCommand) {
        self.outbox.send(connection_id, Bytes::from(cmd.encode())).await;
    }

    /// Encodes `cmd` once and shares the frame across every recipient,
    /// rather than re-encoding per connection (`crate::broadcast` doc).
    async fn broadcast(&self, recipients: &[(i32, u64)], cmd: ServerCommand) {
        let frame = Bytes::from(cmd.encode());
        for &(_, conn_id) in recipients {
            self.outbox.send(conn_id, frame.clone()).await;
        }
    }

    async fn broadcast_except(&self, recipients: &[(i32, u64)], except: i32, cmd: ServerCommand) {
        let frame = Bytes::from(cmd.encode());
        for &(user_id, conn_id) in recipients {
            if user_id != except {
                self.outbox.send(conn_id, frame.clone()).await;
            }
        }
    }

    /// Room broadcast for a [`Message`] event, using [`BroadcastMessage`] so
    /// the `ServerCommand::Message` frame is encoded once and its bytes
    /// shared across every recipient via `Arc`.
    async fn broadcast_message(&self, recipients: &[(i32, u64)], msg: Message) {
        let mut bm = BroadcastMessage::new(msg);
        let frame = bm.get_or_encode();
        for &(_, conn_id) in recipients {
            self.outbox.send(conn_id, (*frame).clone()).await;
        }
    }

    fn player_conns(room: &Room) -> Vec<(i32, u64)> {
        room.players.values().map(|p| (p.user.id, p.connection_id)).collect()
    }

    fn room_state_for(room: &Room, user_id: i32) -> ClientRoomState {
        ClientRoomState {
            id: room.id.clone(),
            state: room.state.clone(),
            live: room.live,
            locked: room.locked,
            cycle: room.cycle,
            is_host: room.is_owner(user_id),
            is_ready: room.players.get(&user_id).is_some_and(|p| p.is_ready),
            users: room.players.values().map(|p| p.user.clone()).collect(),
        }
    }

    /// Dispatches one decoded client command. `Authenticate` is handled here
    /// directly since it needs the connection's remote address; every other
    /// command resolves the caller's session first.
    pub async fn dispatch(&self, connection_id: u64, remote_addr: SocketAddr, cmd: ClientCommand) {
        debug!(connection_id, ?cmd, "dispatching client command");

        if !matches!(cmd, ClientCommand::Ping | ClientCommand::Authenticate { .. }) {
            let router = self.federation_router.read().await.clone();
            if let Some(router) = router {
                if router.forward_if_remote(connection_id, &cmd).await {
                    return;
                }
            }
        }

        match cmd {
            ClientCommand::Ping => self.send(connection_id, ServerCommand::Pong).await,
            ClientCommand::Authenticate { token } => {
                self.authenticate(connection_id, remote_addr, &token).await;
            }
            ClientCommand::Chat { message } => self.chat(connection_id, message).await,
            ClientCommand::Touches => self.forward_telemetry(connection_id, true).await,
            ClientCommand::Judges => self.forward_telemetry(connection_id, false).await,
            ClientCommand::CreateRoom { id } => self.create_room(connection_id, id).await,
            ClientCommand::JoinRoom { id, monitor } => self.join_room(connection_id, id, monitor).await,
            ClientCommand::LeaveRoom => {
                self.leave_room(connection_id, true).await;
            }
            ClientCommand::LockRoom { lock } => self.lock_room(connection_id, lock).await,
            ClientCommand::CycleRoom { cycle } => self.cycle_room(connection_id, cycle).await,
            ClientCommand::SelectChart { chart_id } => self.select_chart(connection_id, chart_id).await,
            ClientCommand::RequestStart => self.request_start(connection_id).await,
            ClientCommand::Ready => self.ready(connection_id).await,
            ClientCommand::CancelReady => self.cancel_ready(connection_id).await,
            ClientCommand::Played { record_id } => self.played(connection_id, record_id).await,
            ClientCommand::Abort => self.abort(connection_id).await,
            ClientCommand::GameResult {
                score,
                accuracy,
                perfect,
                good,
                bad,
                miss,
                max_combo,
            } => {
                let result = PlayerScore {
                    score,
                    accuracy,
                    perfect,
                    good,
                    bad,
                    miss,
                    max_combo,
                    finish_time: now_ms(),
                };
                self.game_result(connection_id, result).await;
            }
        }
    }

    async fn session_user(&self, connection_id: u64) -> Result<i32, ProtocolError> {
        self.sessions
            .get(connection_id)
            .await
            .map(|s| s.user_id)
            .ok_or(ProtocolError::NotAuthenticated)
    }

    async fn current_room_id(&self, user_id: i32) -> Result<String, ProtocolError> {
        self.rooms
            .room_of_user(user_id)
            .await
            .ok_or(ProtocolError::Room(RoomError::NotInRoom))
    }

    // -- Authenticate -------------------------------------------------

    async fn authenticate(&self, connection_id: u64, remote_addr: SocketAddr, token: &str) {
        let result = self
            .sessions
            .authenticate(
                connection_id,
                remote_addr,
                token,
                self.token_length,
                self.auth_client.as_ref(),
                self.ban_store.as_ref(),
                &self.rooms,
            )
            .await;

        match result {
            Ok(outcome) => {
                if let Some(old_conn) = outcome.evict_connection_id {
                    if outcome.evict_is_full_disconnect {
                        self.run_disconnect(old_conn).await;
                    } else {
                        // Room membership already migrated onto the new
                        // connection; just tear down the stale socket
                        // without emitting `LeaveRoom` for it.
                        self.outbox.close(old_conn).await;
                    }
                }

                let room_snapshot = match &outcome.migrated_from_room {
                    Some(room_id) => self
                        .rooms
                        .get(room_id)
                        .await
                        .map(|room| Self::room_state_for(&room, outcome.user_info.id)),
                    None => None,
                };

                self.send(
                    connection_id,
                    ServerCommand::Authenticate(Ok((outcome.user_info.clone(), room_snapshot))),
                )
                .await;
                self.send(
                    connection_id,
                    ServerCommand::Message(Message::Chat {
                        user: crate::room::SERVER_BOT_USER_ID,
                        content: format!("欢迎, {}!", outcome.user_info.name),
                    }),
                )
                .await;
                info!(connection_id, user_id = outcome.user_info.id, "authenticated");
            }
            Err(err) => {
                self.metrics.increment_protocol_errors();
                self.send(
                    connection_id,
                    ServerCommand::Authenticate(Err(err.wire_message())),
                )
                .await;
                if err.is_fatal() {
                    self.outbox.close(connection_id).await;
                }
                warn!(connection_id, %err, "authentication failed");
            }
        }
    }

    // -- Chat / telemetry ----------------------------------------------

    async fn chat(&self, connection_id: u64, message: String) {
        let reply = match self.chat_inner(connection_id, message).await {
            Ok(()) => Ok(()),
            Err(e) => Err(e.wire_message()),
        };
        self.send(connection_id, ServerCommand::Chat(reply)).await;
    }

    async fn chat_inner(&self, connection_id: u64, message: String) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;
        let conns = self
            .rooms
            .mutate(&room_id, |room| {
                room.record_message(Message::Chat { user: user_id, content: message.clone() });
                Self::player_conns(room)
            })
            .await?;
        self.broadcast_message(&conns, Message::Chat { user: user_id, content: message }).await;
        Ok(())
    }

    async fn forward_telemetry(&self, connection_id: u64, is_touch: bool) {
        let Ok(user_id) = self.session_user(connection_id).await else { return };
        let Ok(room_id) = self.current_room_id(user_id).await else { return };
        let Some(room) = self.rooms.get(&room_id).await else { return };
        let conns = Self::player_conns(&room);
        let cmd = if is_touch {
            ServerCommand::Touches { player: user_id }
        } else {
            ServerCommand::Judges { player: user_id }
        };
        self.broadcast_except(&conns, user_id, cmd).await;
    }

    // -- Room membership -------------------------------------------------

    async fn create_room(&self, connection_id: u64, id: String) {
        let result = self.create_room_inner(connection_id, id).await;
        match result {
            Ok(()) => {
                self.metrics.increment_rooms_created();
                self.send(connection_id, ServerCommand::CreateRoom(Ok(()))).await;
            }
            Err(e) => {
                self.metrics.increment_room_creation_failures();
                self.send(connection_id, ServerCommand::CreateRoom(Err(e.wire_message()))).await;
            }
        }
    }

    async fn create_room_inner(&self, connection_id: u64, id: String) -> Result<(), ProtocolError> {
        let session = self.sessions.get(connection_id).await.ok_or(ProtocolError::NotAuthenticated)?;
        self.rooms
            .create(id, session.user_info, connection_id, self.max_room_players, now_ms())
            .await?;
        Ok(())
    }

    async fn join_room(&self, connection_id: u64, id: String, monitor: bool) {
        let result = self.join_room_inner(connection_id, id, monitor).await;
        match result {
            Ok((room_id, state)) => {
                self.metrics.increment_rooms_joined();
                self.metrics.increment_players_joined();
                self.send(connection_id, ServerCommand::JoinRoom(Ok(state.clone()))).await;
                if let Some(room) = self.rooms.get(&room_id).await {
                    let conns = Self::player_conns(&room);
                    if let Some(player) = room.players.values().find(|p| p.connection_id == connection_id) {
                        self.broadcast_except(
                            &conns,
                            player.user.id,
                            ServerCommand::OnJoinRoom(player.user.clone()),
                        )
                        .await;
                        self.broadcast_message(
                            &conns,
                            Message::JoinRoom { user: player.user.id, name: player.user.name.clone() },
                        )
                        .await;
                    }
                }
            }
            Err(ProtocolError::Room(RoomError::NotFound)) => {
                if self.try_remote_join(connection_id, &id, monitor).await {
                    return;
                }
                self.metrics.increment_room_join_failures();
                self.send(
                    connection_id,
                    ServerCommand::JoinRoom(Err(ProtocolError::Room(RoomError::NotFound).wire_message())),
                )
                .await;
            }
            Err(e) => {
                self.metrics.increment_room_join_failures();
                self.send(connection_id, ServerCommand::JoinRoom(Err(e.wire_message()))).await;
            }
        }
    }

    /// Asks the federation router (if wired) whether another node owns
    /// `room_id`. Returns `true` once the router has taken over the join
    /// end to end, including the wire reply.
    async fn try_remote_join(&self, connection_id: u64, room_id: &str, monitor: bool) -> bool {
        let Some(router) = self.federation_router.read().await.clone() else { return false };
        let Some(session) = self.sessions.get(connection_id).await else { return false };
        let mut user = session.user_info;
        user.monitor = monitor;
        router
            .try_join_remote_room(connection_id, user, room_id.to_string(), monitor)
            .await
            .is_some()
    }

    async fn join_room_inner(
        &self,
        connection_id: u64,
        id: String,
        monitor: bool,
    ) -> Result<(String, ClientRoomState), ProtocolError> {
        let session = self.sessions.get(connection_id).await.ok_or(ProtocolError::NotAuthenticated)?;
        let mut user_info = session.user_info;
        user_info.monitor = monitor;
        let user_id = user_info.id;
        self.rooms.join(&id, user_info, connection_id).await?;
        self.rooms
            .mutate(&id, |room| {
                let name = room.players[&user_id].user.name.clone();
                room.record_message(Message::JoinRoom { user: user_id, name });
            })
            .await
            .map_err(ProtocolError::Room)?;
        let room = self.rooms.get(&id).await.ok_or(ProtocolError::Room(RoomError::NotFound))?;
        let state = Self::room_state_for(&room, user_id);
        Ok((id, state))
    }

    async fn leave_room(&self, connection_id: u64, report_fully: bool) -> Option<String> {
        let Some(session) = self.sessions.get(connection_id).await else { return None };
        let user_id = session.user_id;
        let Some((room_id, new_owner, deleted)) = self.rooms.leave(user_id).await else {
            if report_fully {
                self.send(connection_id, ServerCommand::LeaveRoom(Ok(()))).await;
            }
            return None;
        };

        self.metrics.increment_players_left();
        if report_fully {
            self.send(connection_id, ServerCommand::LeaveRoom(Ok(()))).await;
        }

        if deleted {
            self.metrics.increment_rooms_deleted();
            return Some(room_id);
        }

        if let Some(room) = self.rooms.get(&room_id).await {
            let conns = Self::player_conns(&room);
            self.broadcast_message(&conns, Message::LeaveRoom { user: user_id, name: session.user_info.name.clone() }).await;
            if let Some(new_owner) = new_owner {
                self.metrics.increment_owner_transfers();
                for &(uid, conn) in &conns {
                    self.send(conn, ServerCommand::ChangeHost(uid == new_owner)).await;
                }
                self.broadcast_message(&conns, Message::NewHost { user: new_owner }).await;
            }
            self.check_game_end_if_playing(&room_id).await;
        }
        Some(room_id)
    }

    async fn lock_room(&self, connection_id: u64, lock: bool) {
        let result = self.owner_mutation(connection_id, |room| room.locked = lock).await;
        if let Ok(room_id) = &result {
            if let Some(room) = self.rooms.get(room_id).await {
                self.broadcast_message(&Self::player_conns(&room), Message::LockRoom { lock }).await;
            }
        }
        let reply = result.map(|_| ()).map_err(|e| e.wire_message());
        self.send(connection_id, ServerCommand::LockRoom(reply)).await;
    }

    async fn cycle_room(&self, connection_id: u64, cycle: bool) {
        let result = self.owner_mutation(connection_id, |room| room.cycle = cycle).await;
        if let Ok(room_id) = &result {
            if let Some(room) = self.rooms.get(room_id).await {
                self.broadcast_message(&Self::player_conns(&room), Message::CycleRoom { cycle }).await;
            }
        }
        let reply = result.map(|_| ()).map_err(|e| e.wire_message());
        self.send(connection_id, ServerCommand::CycleRoom(reply)).await;
    }

    /// Applies `f` to the caller's room if they own it, returning the room
    /// id on success so the caller can broadcast the change afterward.
    async fn owner_mutation(
        &self,
        connection_id: u64,
        f: impl FnOnce(&mut Room),
    ) -> Result<String, ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;
        self.rooms
            .mutate(&room_id, |room| {
                if !room.is_owner(user_id) {
                    return Err(RoomError::NotOwner);
                }
                f(room);
                Ok(())
            })
            .await??;
        Ok(room_id)
    }

    // -- Chart select / start -------------------------------------------

    async fn select_chart(&self, connection_id: u64, chart_id: i32) {
        let result = self.select_chart_inner(connection_id, chart_id).await;
        self.send(connection_id, ServerCommand::SelectChart(result.map_err(|e| e.wire_message()))).await;
    }

    async fn select_chart_inner(&self, connection_id: u64, chart_id: i32) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;

        {
            let room = self.rooms.get(&room_id).await.ok_or(RoomError::NotFound)?;
            if !room.is_owner(user_id) {
                return Err(ProtocolError::Room(RoomError::NotOwner));
            }
            if !matches!(room.state, RoomState::SelectChart { .. }) {
                return Err(ProtocolError::Room(RoomError::WrongState));
            }
        }

        let chart = self
            .chart_service
            .lookup(chart_id)
            .await
            .map_err(ProtocolError::Upstream)?;

        let (conns, user_name) = self
            .rooms
            .mutate(&room_id, |room| {
                room.state = RoomState::SelectChart { chart_id: Some(chart.id) };
                room.selected_chart = Some(chart.id);
                room.solo_confirm_pending = false;
                let name = room.players.get(&user_id).map(|p| p.user.name.clone()).unwrap_or_default();
                room.record_message(Message::SelectChart { user: user_id, name: name.clone() });
                (Self::player_conns(room), name)
            })
            .await?;

        self.broadcast_message(&conns, Message::SelectChart { user: user_id, name: user_name }).await;
        self.broadcast(&conns, ServerCommand::ChangeState(Some(RoomState::SelectChart { chart_id: Some(chart.id) }))).await;
        Ok(())
    }

    async fn request_start(&self, connection_id: u64) {
        let result = self.request_start_inner(connection_id).await;
        self.send(connection_id, ServerCommand::RequestStart(result.map_err(|e| e.wire_message()))).await;
    }

    async fn request_start_inner(&self, connection_id: u64) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;

        enum Outcome {
            AskedSoloConfirm,
            StartedWaiting { conns: Vec<(i32, u64)> },
            StartedPlaying { conns: Vec<(i32, u64)> },
        }

        let outcome = self
            .rooms
            .mutate(&room_id, |room| -> Result<Outcome, RoomError> {
                if !room.is_owner(user_id) {
                    return Err(RoomError::NotOwner);
                }
                if !matches!(room.state, RoomState::SelectChart { .. }) {
                    return Err(RoomError::WrongState);
                }
                if room.selected_chart.is_none() {
                    return Err(RoomError::NoChartSelected);
                }

                let active = room.active_player_count();
                if active < 2 {
                    if room.solo_confirm_pending {
                        room.solo_confirm_pending = false;
                        room.reset_for_next_round();
                        room.state = RoomState::Playing;
                        room.record_message(Message::StartPlaying);
                        return Ok(Outcome::StartedPlaying { conns: Self::player_conns(room) });
                    }
                    room.solo_confirm_pending = true;
                    room.record_message(Message::Chat {
                        user: crate::room::SERVER_BOT_USER_ID,
                        content: "只有一名玩家，再次发送开始确认单人游戏".to_string(),
                    });
                    return Ok(Outcome::AskedSoloConfirm);
                }

                room.reset_for_next_round();
                if let Some(owner) = room.players.get_mut(&room.owner_id) {
                    owner.is_ready = true;
                }
                room.state = RoomState::WaitingForReady;
                let owner_name = room.players.get(&user_id).map(|p| p.user.name.clone()).unwrap_or_default();
                room.record_message(Message::GameStart { user: user_id, name: owner_name });
                Ok(Outcome::StartedWaiting { conns: Self::player_conns(room) })
            })
            .await??;

        match outcome {
            Outcome::AskedSoloConfirm => {}
            Outcome::StartedWaiting { conns } => {
                self.broadcast(&conns, ServerCommand::ChangeState(Some(RoomState::WaitingForReady))).await;
            }
            Outcome::StartedPlaying { conns } => {
                self.broadcast_message(&conns, Message::StartPlaying).await;
                self.broadcast(&conns, ServerCommand::ChangeState(Some(RoomState::Playing))).await;
            }
        }
        Ok(())
    }

    // -- Ready gate -------------------------------------------------------

    async fn ready(&self, connection_id: u64) {
        let result = self.ready_inner(connection_id).await;
        self.send(connection_id, ServerCommand::Ready(result.map_err(|e| e.wire_message()))).await;
    }

    async fn ready_inner(&self, connection_id: u64) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;

        enum Outcome {
            StillWaiting { conns: Vec<(i32, u64)> },
            AllReady { conns: Vec<(i32, u64)> },
        }

        let outcome = self
            .rooms
            .mutate(&room_id, |room| -> Result<Outcome, RoomError> {
                if !matches!(room.state, RoomState::WaitingForReady) {
                    return Err(RoomError::WrongState);
                }
                let player = room.players.get_mut(&user_id).ok_or(RoomError::NotInRoom)?;
                if player.is_ready {
                    return Err(RoomError::NotReady);
                }
                player.is_ready = true;
                room.record_message(Message::Ready { user: user_id });

                let ids = room.non_monitor_player_ids_in_join_order();
                let all_ready = ids.iter().all(|id| room.players.get(id).is_some_and(|p| p.is_ready));
                if all_ready {
                    room.reset_for_next_round();
                    room.state = RoomState::Playing;
                    room.record_message(Message::StartPlaying);
                    Ok(Outcome::AllReady { conns: Self::player_conns(room) })
                } else {
                    Ok(Outcome::StillWaiting { conns: Self::player_conns(room) })
                }
            })
            .await??;

        match outcome {
            Outcome::StillWaiting { conns } => {
                self.broadcast_message(&conns, Message::Ready { user: user_id }).await;
            }
            Outcome::AllReady { conns } => {
                self.broadcast_message(&conns, Message::StartPlaying).await;
                self.broadcast(&conns, ServerCommand::ChangeState(Some(RoomState::Playing))).await;
            }
        }
        Ok(())
    }

    async fn cancel_ready(&self, connection_id: u64) {
        let result = self.cancel_ready_inner(connection_id).await;
        self.send(connection_id, ServerCommand::CancelReady(result.map_err(|e| e.wire_message()))).await;
    }

    async fn cancel_ready_inner(&self, connection_id: u64) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;

        enum Outcome {
            OwnerCancelledGame { conns: Vec<(i32, u64)> },
            PlayerCancelledOwnReady { conns: Vec<(i32, u64)> },
        }

        let outcome = self
            .rooms
            .mutate(&room_id, |room| -> Result<Outcome, RoomError> {
                if !matches!(room.state, RoomState::WaitingForReady) {
                    return Err(RoomError::WrongState);
                }
                let is_owner = room.is_owner(user_id);
                let is_ready = room.players.get(&user_id).is_some_and(|p| p.is_ready);
                if !is_owner && !is_ready {
                    return Err(RoomError::NotReady);
                }
                if is_owner {
                    room.reset_for_next_round();
                    room.state = RoomState::SelectChart { chart_id: room.selected_chart };
                    room.record_message(Message::CancelGame { user: user_id });
                    Ok(Outcome::OwnerCancelledGame { conns: Self::player_conns(room) })
                } else {
                    if let Some(p) = room.players.get_mut(&user_id) {
                        p.is_ready = false;
                    }
                    room.record_message(Message::CancelReady { user: user_id });
                    Ok(Outcome::PlayerCancelledOwnReady { conns: Self::player_conns(room) })
                }
            })
            .await??;

        match outcome {
            Outcome::OwnerCancelledGame { conns } => {
                self.broadcast_message(&conns, Message::CancelGame { user: user_id }).await;
                if let Some(room) = self.rooms.get(&room_id).await {
                    self.broadcast(&conns, ServerCommand::ChangeState(Some(room.state.clone()))).await;
                }
            }
            Outcome::PlayerCancelledOwnReady { conns } => {
                self.broadcast_message(&conns, Message::CancelReady { user: user_id }).await;
            }
        }
        Ok(())
    }

    // -- Playing: results and disconnects --------------------------------

    /// `GameResult` has no wire acknowledgement — the client learns its
    /// outcome from the room's `GameEnd` broadcast, so failures here just
    /// count toward metrics instead of replying to the submitter.
    async fn game_result(&self, connection_id: u64, score: PlayerScore) {
        if let Err(err) = self.record_result(connection_id, score).await {
            self.metrics.increment_protocol_errors();
            warn!(connection_id, %err, "game result rejected");
        }
    }

    async fn played(&self, connection_id: u64, record_id: i32) {
        let result = self.played_inner(connection_id, record_id).await;
        self.send(connection_id, ServerCommand::Played(result.map_err(|e| e.wire_message()))).await;
    }

    async fn played_inner(&self, connection_id: u64, record_id: i32) -> Result<(), ProtocolError> {
        let score = self
            .chart_service
            .fetch_record(record_id)
            .await
            .map_err(ProtocolError::Upstream)?;
        self.record_result(connection_id, score).await
    }

    async fn record_result(&self, connection_id: u64, score: PlayerScore) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;

        let conns = self
            .rooms
            .mutate(&room_id, |room| -> Result<Vec<(i32, u64)>, RoomError> {
                if !matches!(room.state, RoomState::Playing) {
                    return Err(RoomError::WrongState);
                }
                let player = room.players.get_mut(&user_id).ok_or(RoomError::NotInRoom)?;
                if player.is_finished {
                    return Err(RoomError::WrongState);
                }
                player.is_finished = true;
                player.score = Some(score);
                room.record_message(Message::Played { user: user_id, score });
                Ok(Self::player_conns(room))
            })
            .await??;

        self.broadcast_message(&conns, Message::Played { user: user_id, score }).await;
        self.check_game_end_if_playing(&room_id).await;
        Ok(())
    }

    async fn abort(&self, connection_id: u64) {
        let result = self.abort_inner(connection_id).await;
        self.send(connection_id, ServerCommand::Abort(result.map_err(|e| e.wire_message()))).await;
    }

    async fn abort_inner(&self, connection_id: u64) -> Result<(), ProtocolError> {
        let user_id = self.session_user(connection_id).await?;
        let room_id = self.current_room_id(user_id).await?;
        self.abort_user_in_room(&room_id, user_id).await
    }

    async fn abort_user_in_room(&self, room_id: &str, user_id: i32) -> Result<(), ProtocolError> {
        let zero = PlayerScore { score: 0, accuracy: 0.0, perfect: 0, good: 0, bad: 0, miss: 0, max_combo: 0, finish_time: now_ms() };
        let (conns, name) = self
            .rooms
            .mutate(room_id, |room| -> Result<(Vec<(i32, u64)>, String), RoomError> {
                let player = room.players.get_mut(&user_id).ok_or(RoomError::NotInRoom)?;
                player.is_finished = true;
                player.score = Some(zero);
                let name = player.user.name.clone();
                room.record_message(Message::Abort { user: user_id, name: name.clone() });
                Ok((Self::player_conns(room), name))
            })
            .await??;

        self.broadcast_message(&conns, Message::Abort { user: user_id, name }).await;
        self.check_game_end_if_playing(room_id).await;
        Ok(())
    }

    /// Runs the §4.4 "game end" procedure if the room is `Playing` and every
    /// active player has finished (or there are no active players left).
    async fn check_game_end_if_playing(&self, room_id: &str) {
        enum Outcome {
            NotDone,
            Ended {
                conns: Vec<(i32, u64)>,
                summary: GameEndSummary,
                new_state: RoomState,
                new_owner: Option<i32>,
            },
        }

        let outcome = self
            .rooms
            .mutate(room_id, |room| -> Outcome {
                if !matches!(room.state, RoomState::Playing) {
                    return Outcome::NotDone;
                }
                let ids = room.non_monitor_player_ids_in_join_order();
                let all_finished = ids.iter().all(|id| room.players.get(id).is_some_and(|p| p.is_finished));
                if !all_finished {
                    return Outcome::NotDone;
                }

                let rankings = room.compute_rankings();
                let summary = GameEndSummary { chart_id: room.selected_chart, ended_at: now_ms(), rankings };
                room.record_message(Message::GameEnd(summary.clone()));
                room.reset_for_next_round();

                let new_owner = if room.cycle {
                    let next = room.next_owner_for_cycle(room.owner_id);
                    if let Some(next) = next {
                        room.owner_id = next;
                    }
                    room.state = RoomState::WaitingForReady;
                    next
                } else {
                    room.last_game_chart = room.selected_chart;
                    room.state = RoomState::SelectChart { chart_id: room.selected_chart };
                    room.selected_chart = None;
                    None
                };

                Outcome::Ended {
                    conns: Self::player_conns(room),
                    summary,
                    new_state: room.state.clone(),
                    new_owner,
                }
            })
            .await;

        let Ok(Outcome::Ended { conns, summary, new_state, new_owner }) = outcome else { return };

        self.metrics.increment_games_completed();
        self.broadcast_message(&conns, Message::GameEnd(summary)).await;
        if let Some(new_owner) = new_owner {
            self.metrics.increment_owner_transfers();
            for &(uid, conn) in &conns {
                self.send(conn, ServerCommand::ChangeHost(uid == new_owner)).await;
            }
            self.broadcast_message(&conns, Message::NewHost { user: new_owner }).await;
        }
        self.broadcast(&conns, ServerCommand::ChangeState(Some(new_state))).await;
    }

    // -- Disconnect --------------------------------------------------------

    /// Full disconnection path: if the user was mid-game, treats it as an
    /// `Abort` with a zero score before removing the connection and room
    /// membership (§4.4 "Playing | disconnect").
    pub async fn run_disconnect(&self, connection_id: u64) {
        let Some(session) = self.sessions.remove_connection(connection_id).await else { return };
        let user_id = session.user_id;

        if let Some(room_id) = self.rooms.room_of_user(user_id).await {
            if let Some(room) = self.rooms.get(&room_id).await {
                if matches!(room.state, RoomState::Playing) {
                    let _ = self.abort_user_in_room(&room_id, user_id).await;
                }
            }
        }

        self.leave_room_for_user(user_id).await;
        info!(connection_id, user_id, "connection disconnected");
    }

    async fn leave_room_for_user(&self, user_id: i32) {
        let Some((room_id, new_owner, deleted)) = self.rooms.leave(user_id).await else { return };
        self.metrics.increment_players_left();
        if deleted {
            self.metrics.increment_rooms_deleted();
            return;
        }
        let Some(room) = self.rooms.get(&room_id).await else { return };
        let conns = Self::player_conns(&room);
        self.broadcast_message(&conns, Message::LeaveRoom { user: user_id, name: String::new() }).await;
        if let Some(new_owner) = new_owner {
            self.metrics.increment_owner_transfers();
            for &(uid, conn) in &conns {
                self.send(conn, ServerCommand::ChangeHost(uid == new_owner)).await;
            }
            self.broadcast_message(&conns, Message::NewHost { user: new_owner }).await;
        }
    }

    // -- Admin operations (web bridge) -----------------------------------
    //
    // Unlike the client-facing handlers above, these skip the caller's own
    // session/ownership checks — the web bridge has already authorized the
    // call against the admin session/secret before reaching here.

    /// Forcibly disconnects `user_id` from whatever room they're in, running
    /// the same abort-then-leave path as an ungraceful socket close, then
    /// closes their actual connection so they can't keep acting on stale state.
    pub async fn admin_kick_player(&self, user_id: i32) -> Result<(), ProtocolError> {
        let room_id = self.rooms.room_of_user(user_id).await.ok_or(RoomError::NotInRoom)?;
        let room = self.rooms.get(&room_id).await.ok_or(RoomError::NotFound)?;
        let connection_id = room.players.get(&user_id).ok_or(RoomError::NotInRoom)?.connection_id;
        self.run_disconnect(connection_id).await;
        self.outbox.close(connection_id).await;
        Ok(())
    }

    /// Kicks every player currently in `room_id`, which empties and thus
    /// deletes the room via the ordinary leave path.
    pub async fn admin_close_room(&self, room_id: &str) -> Result<(), ProtocolError> {
        let room = self.rooms.get(room_id).await.ok_or(RoomError::NotFound)?;
        let member_ids: Vec<i32> = room.players.keys().copied().collect();
        for user_id in member_ids {
            let _ = self.admin_kick_player(user_id).await;
        }
        Ok(())
    }

    pub async fn admin_toggle_lock(&self, room_id: &str, lock: bool) -> Result<(), ProtocolError> {
        let conns = self
            .rooms
            .mutate(room_id, |room| {
                room.locked = lock;
                Self::player_conns(room)
            })
            .await?;
        self.broadcast_message(&conns, Message::LockRoom { lock }).await;
        Ok(())
    }

    pub async fn admin_toggle_mode(&self, room_id: &str, cycle: bool) -> Result<(), ProtocolError> {
        let conns = self
            .rooms
            .mutate(room_id, |room| {
                room.cycle = cycle;
                Self::player_conns(room)
            })
            .await?;
        self.broadcast_message(&conns, Message::CycleRoom { cycle }).await;
        Ok(())
    }

    pub async fn admin_set_max_players(&self, room_id: &str, max_players: u8) -> Result<(), ProtocolError> {
        self.rooms.mutate(room_id, |room| room.max_players = max_players).await?;
        Ok(())
    }

    /// Bypasses the owner/ready/solo-confirm gates `RequestStart` enforces
    /// and drives the room straight into `Playing`.
    pub async fn admin_force_start(&self, room_id: &str) -> Result<(), ProtocolError> {
        let conns = self
            .rooms
            .mutate(room_id, |room| -> Result<Vec<(i32, u64)>, RoomError> {
                if room.selected_chart.is_none() {
                    return Err(RoomError::NoChartSelected);
                }
                room.solo_confirm_pending = false;
                room.reset_for_next_round();
                room.state = RoomState::Playing;
                room.record_message(Message::StartPlaying);
                Ok(Self::player_conns(room))
            })
            .await??;
        self.broadcast_message(&conns, Message::StartPlaying).await;
        self.broadcast(&conns, ServerCommand::ChangeState(Some(RoomState::Playing))).await;
        Ok(())
    }

    /// Broadcasts a chat line attributed to the server bot, used for admin
    /// announcements (§4.6).
    pub async fn admin_send_server_message(&self, room_id: &str, content: String) -> Result<(), ProtocolError> {
        let conns = self
            .rooms
            .mutate(room_id, |room| {
                room.record_message(Message::Chat { user: crate::room::SERVER_BOT_USER_ID, content: content.clone() });
                Self::player_conns(room)
            })
            .await?;
        self.broadcast_message(&conns, Message::Chat { user: crate::room::SERVER_BOT_USER_ID, content }).await;
        Ok(())
    }
}

#[async_trait]
impl EngineHandle for ProtocolEngine {
    async fn handle_message(&self, connection_id: u64, cmd: ClientCommand) {
        let remote_addr: SocketAddr = "0.0.0.0:0".parse().expect("constant address literal is valid");
        self.dispatch(connection_id, remote_addr, cmd).await;
    }

    async fn handle_disconnection(&self, connection_id: u64) {
        self.run_disconnect(connection_id).await;
    }

    async fn send_command_to_user(&self, user_id: i32, cmd: ServerCommand) {
        if let Some(session) = self.sessions.get_by_user(user_id).await {
            self.send(session.connection_id, cmd).await;
        }
    }

    async fn create_federated_session(&self, connection_id: u64, user: UserInfo, remote_addr: SocketAddr) {
        self.sessions.register_federated(connection_id, user, remote_addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_client::StaticAuthClient;
    use crate::ban_store::InMemoryBanStore;
    use crate::chart_service::StaticChartService;
    use crate::codec::server::ServerCommand as SC;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingOutbox {
        inner: Mutex<HashMap<u64, Vec<ServerCommand>>>,
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send(&self, connection_id: u64, frame: Bytes) {
            if frame.is_empty() {
                return;
            }
            let cmd = ServerCommand::decode(&frame).unwrap();
            self.inner.lock().await.entry(connection_id).or_default().push(cmd);
        }

        async fn close(&self, _connection_id: u64) {}
    }

    impl RecordingOutbox {
        async fn last(&self, connection_id: u64) -> Option<ServerCommand> {
            self.inner.lock().await.get(&connection_id).and_then(|v| v.last().cloned())
        }

        async fn all(&self, connection_id: u64) -> Vec<ServerCommand> {
            self.inner.lock().await.get(&connection_id).cloned().unwrap_or_default()
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn build() -> (Arc<ProtocolEngine>, Arc<RecordingOutbox>) {
        let sessions = SessionTable::new();
        let rooms = RoomStore::new();
        let auth = Arc::new(StaticAuthClient::default());
        auth.insert(&"a".repeat(20), UserInfo { id: 1, name: "owner".into(), monitor: false });
        auth.insert(&"b".repeat(20), UserInfo { id: 2, name: "guest".into(), monitor: false });
        let charts = Arc::new(StaticChartService::with_chart(42, "Test"));
        let bans = Arc::new(InMemoryBanStore::new());
        let metrics = Arc::new(ServerMetrics::new());
        let outbox = Arc::new(RecordingOutbox::default());
        let engine = ProtocolEngine::new(
            sessions,
            rooms,
            auth,
            charts,
            bans,
            metrics,
            outbox.clone(),
            20,
            8,
        );
        (engine, outbox)
    }

    #[tokio::test]
    async fn two_player_happy_path_ends_with_rankings() {
        let (engine, outbox) = build().await;
        engine.dispatch(1, addr(), ClientCommand::Authenticate { token: "a".repeat(20) }).await;
        engine.dispatch(2, addr(), ClientCommand::Authenticate { token: "b".repeat(20) }).await;
        engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "r1".into() }).await;
        engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "r1".into(), monitor: false }).await;
        engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 42 }).await;
        engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
        engine.dispatch(2, addr(), ClientCommand::Ready).await;

        engine
            .dispatch(1, addr(), ClientCommand::GameResult {
                score: 1_000_000, accuracy: 99.5, perfect: 100, good: 0, bad: 0, miss: 0, max_combo: 100,
            })
            .await;
        engine
            .dispatch(2, addr(), ClientCommand::GameResult {
                score: 750_000, accuracy: 90.0, perfect: 90, good: 5, bad: 2, miss: 1, max_combo: 50,
            })
            .await;

        let all = outbox.all(1).await;
        let game_end = all.iter().rev().find_map(|c| match c {
            SC::Message(Message::GameEnd(summary)) => Some(summary.clone()),
            _ => None,
        });
        let summary = game_end.expect("expected a GameEnd broadcast");
        assert_eq!(summary.chart_id, Some(42));
        assert_eq!(summary.rankings[0].user_id, 1);
        assert_eq!(summary.rankings[1].user_id, 2);
    }

    #[tokio::test]
    async fn owner_cancel_without_ready_returns_to_select_chart() {
        let (engine, outbox) = build().await;
        engine.dispatch(1, addr(), ClientCommand::Authenticate { token: "a".repeat(20) }).await;
        engine.dispatch(2, addr(), ClientCommand::Authenticate { token: "b".repeat(20) }).await;
        engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "r1".into() }).await;
        engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "r1".into(), monitor: false }).await;
        engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 42 }).await;
        engine.dispatch(1, addr(), ClientCommand::RequestStart).await;

        engine.dispatch(1, addr(), ClientCommand::CancelReady).await;
        let reply = outbox.last(1).await.unwrap();
        assert_eq!(reply, SC::CancelReady(Ok(())));

        let room = engine.rooms.get("r1").await.unwrap();
        assert!(matches!(room.state, RoomState::SelectChart { .. }));
    }

    #[tokio::test]
    async fn mid_game_disconnect_counts_as_abort_and_ends_game() {
        let (engine, _outbox) = build().await;
        engine.dispatch(1, addr(), ClientCommand::Authenticate { token: "a".repeat(20) }).await;
        engine.dispatch(2, addr(), ClientCommand::Authenticate { token: "b".repeat(20) }).await;
        engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "r1".into() }).await;
        engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "r1".into(), monitor: false }).await;
        engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 42 }).await;
        engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
        engine.dispatch(2, addr(), ClientCommand::Ready).await;

        engine
            .dispatch(1, addr(), ClientCommand::GameResult {
                score: 500_000, accuracy: 95.0, perfect: 50, good: 0, bad: 0, miss: 0, max_combo: 50,
            })
            .await;

        engine.run_disconnect(2).await;

        let room = engine.rooms.get("r1").await.unwrap();
        assert!(matches!(room.state, RoomState::SelectChart { .. }));
    }

    #[tokio::test]
    async fn solo_request_start_requires_second_confirmation() {
        let (engine, _outbox) = build().await;
        engine.dispatch(1, addr(), ClientCommand::Authenticate { token: "a".repeat(20) }).await;
        engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "r1".into() }).await;
        engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 42 }).await;

        engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
        let room = engine.rooms.get("r1").await.unwrap();
        assert!(room.solo_confirm_pending);
        assert!(matches!(room.state, RoomState::SelectChart { .. }));

        engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
        let room = engine.rooms.get("r1").await.unwrap();
        assert!(!room.solo_confirm_pending);
        assert!(matches!(room.state, RoomState::Playing));
    }
}
