//! Client -> server command encoding (opcodes 0..=16).

use super::{DecodeError, Reader, Writer};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Ping,
    Authenticate { token: String },
    Chat { message: String },
    /// Touch-frame telemetry; payload shape is owned by the client SDK and
    /// discarded on decode — only monitors ever look at it, server-side.
    Touches,
    /// Judge-event telemetry; discarded like `Touches`.
    Judges,
    CreateRoom { id: String },
    JoinRoom { id: String, monitor: bool },
    LeaveRoom,
    LockRoom { lock: bool },
    CycleRoom { cycle: bool },
    SelectChart { chart_id: i32 },
    RequestStart,
    Ready,
    CancelReady,
    Played { record_id: i32 },
    Abort,
    GameResult {
        score: i32,
        accuracy: f32,
        perfect: i32,
        good: i32,
        bad: i32,
        miss: i32,
        max_combo: i32,
    },
}

impl ClientCommand {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(buf);
        let opcode = r.read_u8()?;
        let cmd = match opcode {
            0 => Self::Ping,
            1 => Self::Authenticate { token: r.read_string()? },
            2 => Self::Chat { message: r.read_string()? },
            3 => {
                r.skip_to_end();
                Self::Touches
            }
            4 => {
                r.skip_to_end();
                Self::Judges
            }
            5 => Self::CreateRoom { id: r.read_string()? },
            6 => Self::JoinRoom {
                id: r.read_string()?,
                monitor: r.read_bool()?,
            },
            7 => Self::LeaveRoom,
            8 => Self::LockRoom { lock: r.read_bool()? },
            9 => Self::CycleRoom { cycle: r.read_bool()? },
            10 => Self::SelectChart { chart_id: r.read_i32()? },
            11 => Self::RequestStart,
            12 => Self::Ready,
            13 => Self::CancelReady,
            14 => Self::Played { record_id: r.read_i32()? },
            15 => Self::Abort,
            16 => Self::GameResult {
                score: r.read_i32()?,
                accuracy: r.read_f32()?,
                perfect: r.read_i32()?,
                good: r.read_i32()?,
                bad: r.read_i32()?,
                miss: r.read_i32()?,
                max_combo: r.read_i32()?,
            },
            other => {
                r.skip_to_end();
                return Err(DecodeError::UnknownVariant(other));
            }
        };
        Ok(cmd)
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Ping => w.write_u8(0),
            Self::Authenticate { token } => {
                w.write_u8(1);
                w.write_string(token);
            }
            Self::Chat { message } => {
                w.write_u8(2);
                w.write_string(message);
            }
            Self::Touches => w.write_u8(3),
            Self::Judges => w.write_u8(4),
            Self::CreateRoom { id } => {
                w.write_u8(5);
                w.write_string(id);
            }
            Self::JoinRoom { id, monitor } => {
                w.write_u8(6);
                w.write_string(id);
                w.write_bool(*monitor);
            }
            Self::LeaveRoom => w.write_u8(7),
            Self::LockRoom { lock } => {
                w.write_u8(8);
                w.write_bool(*lock);
            }
            Self::CycleRoom { cycle } => {
                w.write_u8(9);
                w.write_bool(*cycle);
            }
            Self::SelectChart { chart_id } => {
                w.write_u8(10);
                w.write_i32(*chart_id);
            }
            Self::RequestStart => w.write_u8(11),
            Self::Ready => w.write_u8(12),
            Self::CancelReady => w.write_u8(13),
            Self::Played { record_id } => {
                w.write_u8(14);
                w.write_i32(*record_id);
            }
            Self::Abort => w.write_u8(15),
            Self::GameResult {
                score,
                accuracy,
                perfect,
                good,
                bad,
                miss,
                max_combo,
            } => {
                w.write_u8(16);
                w.write_i32(*score);
                w.write_f32(*accuracy);
                w.write_i32(*perfect);
                w.write_i32(*good);
                w.write_i32(*bad);
                w.write_i32(*miss);
                w.write_i32(*max_combo);
            }
        }
        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: ClientCommand) {
        let encoded = cmd.encode();
        let decoded = ClientCommand::decode(&encoded).unwrap();
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn roundtrips_every_variant() {
        roundtrip(ClientCommand::Ping);
        roundtrip(ClientCommand::Authenticate { token: "a".repeat(20) });
        roundtrip(ClientCommand::Chat { message: "hi".into() });
        roundtrip(ClientCommand::CreateRoom { id: "room-1".into() });
        roundtrip(ClientCommand::JoinRoom { id: "room-1".into(), monitor: true });
        roundtrip(ClientCommand::LeaveRoom);
        roundtrip(ClientCommand::LockRoom { lock: true });
        roundtrip(ClientCommand::CycleRoom { cycle: false });
        roundtrip(ClientCommand::SelectChart { chart_id: 42 });
        roundtrip(ClientCommand::RequestStart);
        roundtrip(ClientCommand::Ready);
        roundtrip(ClientCommand::CancelReady);
        roundtrip(ClientCommand::Played { record_id: 7 });
        roundtrip(ClientCommand::Abort);
        roundtrip(ClientCommand::GameResult {
            score: 1_000_000,
            accuracy: 99.5,
            perfect: 100,
            good: 2,
            bad: 1,
            miss: 0,
            max_combo: 103,
        });
    }

    #[test]
    fn unknown_opcode_drains_frame_without_panicking() {
        let err = ClientCommand::decode(&[255, 1, 2, 3]).unwrap_err();
        assert_eq!(err, DecodeError::UnknownVariant(255));
    }
}
