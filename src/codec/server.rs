//! Server -> client command encoding (opcodes 0..=19) and the `Message`
//! broadcast union recorded into room history.

use super::{DecodeError, Reader, Writer};
use crate::room::{PlayerScore, RankingEntry, RoomState, UserInfo};

/// Room snapshot handed back to a client on successful `JoinRoom`/`CreateRoom`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRoomState {
    pub id: String,
    pub state: RoomState,
    pub live: bool,
    pub locked: bool,
    pub cycle: bool,
    pub is_host: bool,
    pub is_ready: bool,
    pub users: Vec<UserInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameEndSummary {
    pub chart_id: Option<i32>,
    pub ended_at: i64,
    pub rankings: Vec<RankingEntry>,
}

/// Broadcast events appended to room history and fanned out to members.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Chat { user: i32, content: String },
    CreateRoom { user: i32, room: String },
    JoinRoom { user: i32, name: String },
    LeaveRoom { user: i32, name: String },
    NewHost { user: i32 },
    SelectChart { user: i32, name: String },
    GameStart { user: i32, name: String },
    Ready { user: i32 },
    CancelReady { user: i32 },
    CancelGame { user: i32 },
    StartPlaying,
    Played { user: i32, score: PlayerScore },
    GameEnd(GameEndSummary),
    Abort { user: i32, name: String },
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
}

fn write_room_state(w: &mut Writer, state: &RoomState) {
    match state {
        RoomState::SelectChart { chart_id } => {
            w.write_u8(0);
            w.write_option(chart_id, |w, v| w.write_i32(*v));
        }
        RoomState::WaitingForReady => w.write_u8(1),
        RoomState::Playing => w.write_u8(2),
    }
}

fn read_room_state(r: &mut Reader) -> Result<RoomState, DecodeError> {
    match r.read_u8()? {
        0 => Ok(RoomState::SelectChart { chart_id: r.read_option(Reader::read_i32)? }),
        1 => Ok(RoomState::WaitingForReady),
        2 => Ok(RoomState::Playing),
        other => Err(DecodeError::UnknownVariant(other)),
    }
}

fn write_user_info(w: &mut Writer, u: &UserInfo) {
    w.write_i32(u.id);
    w.write_string(&u.name);
    w.write_bool(u.monitor);
}

fn read_user_info(r: &mut Reader) -> Result<UserInfo, DecodeError> {
    Ok(UserInfo {
        id: r.read_i32()?,
        name: r.read_string()?,
        monitor: r.read_bool()?,
    })
}

fn write_player_score(w: &mut Writer, s: &PlayerScore) {
    w.write_i32(s.score);
    w.write_f32(s.accuracy);
    w.write_i32(s.perfect);
    w.write_i32(s.good);
    w.write_i32(s.bad);
    w.write_i32(s.miss);
    w.write_i32(s.max_combo);
    w.write_i64(s.finish_time);
}

fn read_player_score(r: &mut Reader) -> Result<PlayerScore, DecodeError> {
    Ok(PlayerScore {
        score: r.read_i32()?,
        accuracy: r.read_f32()?,
        perfect: r.read_i32()?,
        good: r.read_i32()?,
        bad: r.read_i32()?,
        miss: r.read_i32()?,
        max_combo: r.read_i32()?,
        finish_time: r.read_i64()?,
    })
}

fn write_ranking(w: &mut Writer, entry: &RankingEntry) {
    w.write_u32(entry.rank);
    w.write_i32(entry.user_id);
    w.write_option(&entry.score, write_player_score);
}

fn read_ranking(r: &mut Reader) -> Result<RankingEntry, DecodeError> {
    Ok(RankingEntry {
        rank: r.read_u32()?,
        user_id: r.read_i32()?,
        score: r.read_option(read_player_score)?,
    })
}

fn write_client_room_state(w: &mut Writer, s: &ClientRoomState) {
    w.write_string(&s.id);
    write_room_state(w, &s.state);
    w.write_bool(s.live);
    w.write_bool(s.locked);
    w.write_bool(s.cycle);
    w.write_bool(s.is_host);
    w.write_bool(s.is_ready);
    w.write_vec(&s.users, write_user_info);
}

fn read_client_room_state(r: &mut Reader) -> Result<ClientRoomState, DecodeError> {
    Ok(ClientRoomState {
        id: r.read_string()?,
        state: read_room_state(r)?,
        live: r.read_bool()?,
        locked: r.read_bool()?,
        cycle: r.read_bool()?,
        is_host: r.read_bool()?,
        is_ready: r.read_bool()?,
        users: r.read_vec(read_user_info)?,
    })
}

impl Message {
    fn tag(&self) -> u8 {
        match self {
            Self::Chat { .. } => 0,
            Self::CreateRoom { .. } => 1,
            Self::JoinRoom { .. } => 2,
            Self::LeaveRoom { .. } => 3,
            Self::NewHost { .. } => 4,
            Self::SelectChart { .. } => 5,
            Self::GameStart { .. } => 6,
            Self::Ready { .. } => 7,
            Self::CancelReady { .. } => 8,
            Self::CancelGame { .. } => 9,
            Self::StartPlaying => 10,
            Self::Played { .. } => 11,
            Self::GameEnd(_) => 12,
            Self::Abort { .. } => 13,
            Self::LockRoom { .. } => 14,
            Self::CycleRoom { .. } => 15,
        }
    }

    fn write(&self, w: &mut Writer) {
        w.write_u8(self.tag());
        match self {
            Self::Chat { user, content } => {
                w.write_i32(*user);
                w.write_string(content);
            }
            Self::CreateRoom { user, room } => {
                w.write_i32(*user);
                w.write_string(room);
            }
            Self::JoinRoom { user, name } | Self::LeaveRoom { user, name }
            | Self::SelectChart { user, name } | Self::GameStart { user, name }
            | Self::Abort { user, name } => {
                w.write_i32(*user);
                w.write_string(name);
            }
            Self::NewHost { user } | Self::Ready { user } | Self::CancelReady { user }
            | Self::CancelGame { user } => {
                w.write_i32(*user);
            }
            Self::StartPlaying => {}
            Self::Played { user, score } => {
                w.write_i32(*user);
                write_player_score(w, score);
            }
            Self::GameEnd(summary) => {
                w.write_option(&summary.chart_id, |w, v| w.write_i32(*v));
                w.write_i64(summary.ended_at);
                w.write_vec(&summary.rankings, write_ranking);
            }
            Self::LockRoom { lock } => w.write_bool(*lock),
            Self::CycleRoom { cycle } => w.write_bool(*cycle),
        }
    }

    fn read(r: &mut Reader) -> Result<Self, DecodeError> {
        let tag = r.read_u8()?;
        let msg = match tag {
            0 => Self::Chat { user: r.read_i32()?, content: r.read_string()? },
            1 => Self::CreateRoom { user: r.read_i32()?, room: r.read_string()? },
            2 => Self::JoinRoom { user: r.read_i32()?, name: r.read_string()? },
            3 => Self::LeaveRoom { user: r.read_i32()?, name: r.read_string()? },
            4 => Self::NewHost { user: r.read_i32()? },
            5 => Self::SelectChart { user: r.read_i32()?, name: r.read_string()? },
            6 => Self::GameStart { user: r.read_i32()?, name: r.read_string()? },
            7 => Self::Ready { user: r.read_i32()? },
            8 => Self::CancelReady { user: r.read_i32()? },
            9 => Self::CancelGame { user: r.read_i32()? },
            10 => Self::StartPlaying,
            11 => Self::Played { user: r.read_i32()?, score: read_player_score(r)? },
            12 => Self::GameEnd(GameEndSummary {
                chart_id: r.read_option(Reader::read_i32)?,
                ended_at: r.read_i64()?,
                rankings: r.read_vec(read_ranking)?,
            }),
            13 => Self::Abort { user: r.read_i32()?, name: r.read_string()? },
            14 => Self::LockRoom { lock: r.read_bool()? },
            15 => Self::CycleRoom { cycle: r.read_bool()? },
            other => {
                r.skip_to_end();
                return Err(DecodeError::UnknownVariant(other));
            }
        };
        Ok(msg)
    }
}

/// Server -> client commands (opcodes 0..=19).
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Pong,
    Authenticate(Result<(UserInfo, Option<ClientRoomState>), String>),
    Chat(Result<(), String>),
    Touches { player: i32 },
    Judges { player: i32 },
    CreateRoom(Result<(), String>),
    JoinRoom(Result<ClientRoomState, String>),
    LeaveRoom(Result<(), String>),
    LockRoom(Result<(), String>),
    CycleRoom(Result<(), String>),
    SelectChart(Result<(), String>),
    RequestStart(Result<(), String>),
    Ready(Result<(), String>),
    CancelReady(Result<(), String>),
    Played(Result<(), String>),
    Abort(Result<(), String>),
    Message(Message),
    ChangeState(Option<RoomState>),
    ChangeHost(bool),
    OnJoinRoom(UserInfo),
}

impl ServerCommand {
    fn tag(&self) -> u8 {
        match self {
            Self::Pong => 0,
            Self::Authenticate(_) => 1,
            Self::Chat(_) => 2,
            Self::Touches { .. } => 3,
            Self::Judges { .. } => 4,
            Self::CreateRoom(_) => 5,
            Self::JoinRoom(_) => 6,
            Self::LeaveRoom(_) => 7,
            Self::LockRoom(_) => 8,
            Self::CycleRoom(_) => 9,
            Self::SelectChart(_) => 10,
            Self::RequestStart(_) => 11,
            Self::Ready(_) => 12,
            Self::CancelReady(_) => 13,
            Self::Played(_) => 14,
            Self::Abort(_) => 15,
            Self::Message(_) => 16,
            Self::ChangeState(_) => 17,
            Self::ChangeHost(_) => 18,
            Self::OnJoinRoom(_) => 19,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(self.tag());
        match self {
            Self::Pong => {}
            Self::Authenticate(res) => w.write_result(res, |w, (info, room)| {
                write_user_info(w, info);
                w.write_option(room, write_client_room_state);
            }),
            Self::Chat(res) | Self::CreateRoom(res) | Self::LeaveRoom(res)
            | Self::LockRoom(res) | Self::CycleRoom(res) | Self::SelectChart(res)
            | Self::RequestStart(res) | Self::Ready(res) | Self::CancelReady(res)
            | Self::Played(res) | Self::Abort(res) => {
                w.write_result(res, |_, _| {});
            }
            Self::Touches { player } | Self::Judges { player } => w.write_i32(*player),
            Self::JoinRoom(res) => w.write_result(res, write_client_room_state),
            Self::Message(msg) => msg.write(&mut w),
            Self::ChangeState(state) => {
                w.write_option(state, write_room_state);
            }
            Self::ChangeHost(is_host) => w.write_bool(*is_host),
            Self::OnJoinRoom(user) => write_user_info(&mut w, user),
        }
        w.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let tag = r.read_u8()?;
        let cmd = match tag {
            0 => Self::Pong,
            1 => Self::Authenticate(r.read_result(|r| {
                let info = read_user_info(r)?;
                let room = r.read_option(read_client_room_state)?;
                Ok((info, room))
            })?),
            2 => Self::Chat(r.read_result(|_| Ok(()))?),
            3 => Self::Touches { player: r.read_i32()? },
            4 => Self::Judges { player: r.read_i32()? },
            5 => Self::CreateRoom(r.read_result(|_| Ok(()))?),
            6 => Self::JoinRoom(r.read_result(read_client_room_state)?),
            7 => Self::LeaveRoom(r.read_result(|_| Ok(()))?),
            8 => Self::LockRoom(r.read_result(|_| Ok(()))?),
            9 => Self::CycleRoom(r.read_result(|_| Ok(()))?),
            10 => Self::SelectChart(r.read_result(|_| Ok(()))?),
            11 => Self::RequestStart(r.read_result(|_| Ok(()))?),
            12 => Self::Ready(r.read_result(|_| Ok(()))?),
            13 => Self::CancelReady(r.read_result(|_| Ok(()))?),
            14 => Self::Played(r.read_result(|_| Ok(()))?),
            15 => Self::Abort(r.read_result(|_| Ok(()))?),
            16 => Self::Message(Message::read(&mut r)?),
            17 => Self::ChangeState(r.read_option(read_room_state)?),
            18 => Self::ChangeHost(r.read_bool()?),
            19 => Self::OnJoinRoom(read_user_info(&mut r)?),
            other => {
                r.skip_to_end();
                return Err(DecodeError::UnknownVariant(other));
            }
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: ServerCommand) {
        let encoded = cmd.encode();
        assert_eq!(ServerCommand::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn roundtrips_result_and_plain_variants() {
        roundtrip(ServerCommand::Pong);
        roundtrip(ServerCommand::Authenticate(Ok((
            UserInfo { id: 1, name: "a".into(), monitor: false },
            None,
        ))));
        roundtrip(ServerCommand::Authenticate(Err("bad token".into())));
        roundtrip(ServerCommand::JoinRoom(Ok(ClientRoomState {
            id: "r1".into(),
            state: RoomState::SelectChart { chart_id: Some(1) },
            live: false,
            locked: false,
            cycle: true,
            is_host: true,
            is_ready: false,
            users: vec![UserInfo { id: 1, name: "a".into(), monitor: false }],
        })));
        roundtrip(ServerCommand::ChangeState(Some(RoomState::Playing)));
        roundtrip(ServerCommand::ChangeState(None));
        roundtrip(ServerCommand::ChangeHost(true));
        roundtrip(ServerCommand::OnJoinRoom(UserInfo { id: 2, name: "b".into(), monitor: true }));
    }

    #[test]
    fn roundtrips_every_message_variant() {
        let messages = vec![
            Message::Chat { user: 1, content: "hi".into() },
            Message::CreateRoom { user: 1, room: "r1".into() },
            Message::JoinRoom { user: 2, name: "b".into() },
            Message::LeaveRoom { user: 2, name: "b".into() },
            Message::NewHost { user: 2 },
            Message::SelectChart { user: 1, name: "chart".into() },
            Message::GameStart { user: 1, name: "a".into() },
            Message::Ready { user: 2 },
            Message::CancelReady { user: 2 },
            Message::CancelGame { user: 1 },
            Message::StartPlaying,
            Message::Played {
                user: 1,
                score: PlayerScore { score: 100, accuracy: 1.0, perfect: 1, good: 0, bad: 0, miss: 0, max_combo: 1, finish_time: 10 },
            },
            Message::GameEnd(GameEndSummary { chart_id: Some(1), ended_at: 100, rankings: vec![] }),
            Message::Abort { user: 1, name: "a".into() },
            Message::LockRoom { lock: true },
            Message::CycleRoom { cycle: false },
        ];
        for m in messages {
            roundtrip(ServerCommand::Message(m));
        }
    }
}
