//! End-to-end coverage of the room lifecycle through the public
//! `ProtocolEngine::dispatch` entry point, the same surface `transport::run`
//! drives per connection. These exercise collaborators wired together
//! (session + room + protocol engine) rather than any single module in
//! isolation.

mod test_helpers;

use phi_session_server::codec::client::ClientCommand;
use phi_session_server::codec::server::{Message, ServerCommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use test_helpers::build_test_server;

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100)
}

/// Room created with `cycle` enabled keeps existing across rounds instead of
/// falling back to `SelectChart`, and the owner role rotates to the next
/// non-monitor player in join order after each game ends.
#[tokio::test]
async fn cycle_mode_rotates_owner_and_reuses_the_room_across_rounds() {
    let (engine, outbox, tokens) =
        build_test_server(42, 4, &[(1, "alice"), (2, "bob")]).await;

    engine.dispatch(1, addr(), ClientCommand::Authenticate { token: tokens[&1].clone() }).await;
    engine.dispatch(2, addr(), ClientCommand::Authenticate { token: tokens[&2].clone() }).await;

    engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "cycle-room".into() }).await;
    engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "cycle-room".into(), monitor: false }).await;

    engine.dispatch(1, addr(), ClientCommand::CycleRoom { cycle: true }).await;
    engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 42 }).await;
    engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
    engine.dispatch(2, addr(), ClientCommand::Ready).await;

    engine.dispatch(1, addr(), ClientCommand::GameResult {
        score: 900_000, accuracy: 0.99, perfect: 950, good: 20, bad: 5, miss: 0, max_combo: 950,
    }).await;
    engine.dispatch(2, addr(), ClientCommand::GameResult {
        score: 700_000, accuracy: 0.90, perfect: 800, good: 60, bad: 20, miss: 10, max_combo: 700,
    }).await;

    let events_1 = outbox.drain(1).await;
    let new_host = events_1.iter().find_map(|cmd| match cmd {
        ServerCommand::Message(Message::NewHost { user }) => Some(*user),
        _ => None,
    });
    assert_eq!(new_host, Some(2), "ownership should rotate to the next joined player");

    let change_states: Vec<_> = events_1
        .iter()
        .filter_map(|cmd| match cmd {
            ServerCommand::ChangeState(state) => Some(state.clone()),
            _ => None,
        })
        .collect();
    let last_state = change_states.last().expect("room should broadcast its post-game state");
    assert!(
        matches!(last_state, Some(phi_session_server::room::RoomState::WaitingForReady)),
        "cycle rooms return to WaitingForReady, not SelectChart, once a round ends: got {last_state:?}",
    );

    let game_end = events_1.iter().find_map(|cmd| match cmd {
        ServerCommand::Message(Message::GameEnd(summary)) => Some(summary.clone()),
        _ => None,
    });
    let rankings = game_end.expect("room should broadcast GameEnd once both players finish").rankings;
    assert_eq!(rankings.len(), 2);
    assert_eq!(rankings[0].user_id, 1, "higher score should rank first");
    assert_eq!(rankings[0].rank, 1);
    assert_eq!(rankings[1].user_id, 2);
    assert_eq!(rankings[1].rank, 2);
}

/// A mid-game disconnect is scored as a zero-point `Abort` rather than simply
/// dropping the player, and the remaining player still receives their
/// `GameEnd` ranking once the room closes out the round.
#[tokio::test]
async fn disconnect_while_playing_counts_as_abort_and_still_ends_the_game() {
    let (engine, outbox, tokens) =
        build_test_server(7, 4, &[(1, "alice"), (2, "bob")]).await;

    engine.dispatch(1, addr(), ClientCommand::Authenticate { token: tokens[&1].clone() }).await;
    engine.dispatch(2, addr(), ClientCommand::Authenticate { token: tokens[&2].clone() }).await;
    engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "abort-room".into() }).await;
    engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "abort-room".into(), monitor: false }).await;
    engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 7 }).await;
    engine.dispatch(1, addr(), ClientCommand::RequestStart).await;
    engine.dispatch(2, addr(), ClientCommand::Ready).await;

    // Player 1 finishes normally; player 2 drops mid-game instead of submitting a result.
    engine.dispatch(1, addr(), ClientCommand::GameResult {
        score: 500_000, accuracy: 0.8, perfect: 500, good: 100, bad: 50, miss: 20, max_combo: 400,
    }).await;
    engine.run_disconnect(2).await;

    let events_1 = outbox.drain(1).await;
    let game_end = events_1.iter().find_map(|cmd| match cmd {
        ServerCommand::Message(Message::GameEnd(summary)) => Some(summary.clone()),
        _ => None,
    });
    let rankings = game_end.expect("abort should still close out the round").rankings;
    assert_eq!(rankings.len(), 2);
    let aborted = rankings.iter().find(|r| r.user_id == 2).expect("aborted player still ranked");
    assert_eq!(aborted.score.as_ref().map(|s| s.score), Some(0));
}

#[tokio::test]
async fn unready_player_blocks_the_room_from_starting() {
    let (engine, outbox, tokens) =
        build_test_server(1, 4, &[(1, "alice"), (2, "bob")]).await;

    engine.dispatch(1, addr(), ClientCommand::Authenticate { token: tokens[&1].clone() }).await;
    engine.dispatch(2, addr(), ClientCommand::Authenticate { token: tokens[&2].clone() }).await;
    engine.dispatch(1, addr(), ClientCommand::CreateRoom { id: "waiting-room".into() }).await;
    engine.dispatch(2, addr(), ClientCommand::JoinRoom { id: "waiting-room".into(), monitor: false }).await;
    engine.dispatch(1, addr(), ClientCommand::SelectChart { chart_id: 1 }).await;
    engine.dispatch(1, addr(), ClientCommand::RequestStart).await;

    let events_1 = outbox.drain(1).await;
    let started_playing = events_1.iter().any(|cmd| {
        matches!(cmd, ServerCommand::ChangeState(Some(phi_session_server::room::RoomState::Playing)))
    });
    assert!(!started_playing, "room must not start until every non-monitor player is ready");
}
