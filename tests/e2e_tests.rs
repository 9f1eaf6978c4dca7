//! Drives the two-player happy path over an actual `TcpStream`, through the
//! real length-prefixed wire codec and `transport::run`'s accept loop, rather
//! than calling `ProtocolEngine::dispatch` directly. Binds to port 0 and
//! reads back the OS-assigned address, the same bind-then-hand-off idiom
//! real socket tests elsewhere in this codebase use to avoid a fixed port.

use phi_session_server::auth_client::StaticAuthClient;
use phi_session_server::ban_store::InMemoryBanStore;
use phi_session_server::chart_service::StaticChartService;
use phi_session_server::codec::client::ClientCommand;
use phi_session_server::codec::server::{Message, ServerCommand};
use phi_session_server::codec::{self, PROTOCOL_VERSION};
use phi_session_server::metrics::ServerMetrics;
use phi_session_server::protocol_engine::ProtocolEngine;
use phi_session_server::room::{RoomState, RoomStore, UserInfo};
use phi_session_server::session::SessionTable;
use phi_session_server::transport::{self, ConnectionRegistry};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accumulates raw bytes read off a socket and yields complete, decoded
/// `ServerCommand` frames as they become available.
#[derive(Default)]
struct Inbox {
    buf: Vec<u8>,
}

impl Inbox {
    fn drain_complete_frames(&mut self) -> Vec<ServerCommand> {
        let mut out = Vec::new();
        let mut consumed = 0usize;
        while let Ok(Some((start, end))) = codec::try_extract_frame(&self.buf[consumed..]) {
            out.push(ServerCommand::decode(&self.buf[consumed + start..consumed + end]).expect("server frame must decode"));
            consumed += end;
        }
        self.buf.drain(..consumed);
        out
    }
}

/// Reads whatever the server has sent since the last call, waiting briefly
/// for traffic to settle rather than assuming how many frames one action
/// produces. Returns the frames decoded this round (the inbox keeps any
/// trailing partial frame for the next call).
async fn pump(stream: &mut TcpStream, inbox: &mut Inbox) -> Vec<ServerCommand> {
    let mut chunk = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_millis(300), stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => inbox.buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    inbox.drain_complete_frames()
}

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect to transport");
    stream.write_all(&[PROTOCOL_VERSION]).await.expect("write version byte");
    stream
}

async fn send(stream: &mut TcpStream, cmd: ClientCommand) {
    let frame = codec::frame(&cmd.encode());
    stream.write_all(&frame).await.expect("write framed command");
}

#[tokio::test]
async fn two_players_authenticate_and_play_a_room_over_the_real_socket() {
    let sessions = SessionTable::new();
    let rooms = RoomStore::new();
    let auth = std::sync::Arc::new(StaticAuthClient::default());
    auth.insert("alice-token-0001234", UserInfo { id: 1, name: "alice".into(), monitor: false });
    auth.insert("bob-token-00001234x", UserInfo { id: 2, name: "bob".into(), monitor: false });
    let charts = std::sync::Arc::new(StaticChartService::with_chart(5, "Test Chart"));
    let bans = std::sync::Arc::new(InMemoryBanStore::new());
    let metrics = std::sync::Arc::new(ServerMetrics::new());
    let registry = ConnectionRegistry::new();

    let engine = ProtocolEngine::new(
        sessions,
        rooms,
        auth,
        charts,
        bans,
        metrics.clone(),
        registry.clone(),
        19,
        4,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("read back bound address");

    tokio::spawn(async move {
        let _ = transport::run(
            listener,
            engine,
            registry,
            metrics,
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;
    });

    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    let mut alice_inbox = Inbox::default();
    let mut bob_inbox = Inbox::default();

    send(&mut alice, ClientCommand::Authenticate { token: "alice-token-0001234".into() }).await;
    let frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(frames.iter().any(|f| matches!(f, ServerCommand::Authenticate(Ok(_)))));

    send(&mut bob, ClientCommand::Authenticate { token: "bob-token-00001234x".into() }).await;
    let frames = pump(&mut bob, &mut bob_inbox).await;
    assert!(frames.iter().any(|f| matches!(f, ServerCommand::Authenticate(Ok(_)))));

    send(&mut alice, ClientCommand::CreateRoom { id: "wire-room".into() }).await;
    let frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(frames.iter().any(|f| matches!(f, ServerCommand::CreateRoom(Ok(_)))));

    send(&mut bob, ClientCommand::JoinRoom { id: "wire-room".into(), monitor: false }).await;
    let bob_frames = pump(&mut bob, &mut bob_inbox).await;
    assert!(bob_frames.iter().any(|f| matches!(f, ServerCommand::JoinRoom(Ok(_)))));
    let alice_frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(
        alice_frames.iter().any(|f| matches!(f, ServerCommand::Message(Message::JoinRoom { user: 2, .. }))),
        "room owner should be told a new player joined: {alice_frames:?}",
    );

    send(&mut alice, ClientCommand::SelectChart { chart_id: 5 }).await;
    let alice_frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(alice_frames.iter().any(|f| matches!(f, ServerCommand::SelectChart(Ok(_)))));
    let bob_frames = pump(&mut bob, &mut bob_inbox).await;
    assert!(
        bob_frames.iter().any(|f| matches!(f, ServerCommand::Message(Message::SelectChart { .. }))),
        "the other player should learn which chart was picked: {bob_frames:?}",
    );

    send(&mut alice, ClientCommand::RequestStart).await;
    let alice_frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(alice_frames.iter().any(|f| matches!(f, ServerCommand::RequestStart(Ok(_)))));
    let bob_frames = pump(&mut bob, &mut bob_inbox).await;
    assert!(
        bob_frames.iter().any(|f| matches!(f, ServerCommand::ChangeState(Some(RoomState::WaitingForReady)))),
        "starting a two-player room should move it to WaitingForReady, not straight to Playing: {bob_frames:?}",
    );

    send(&mut bob, ClientCommand::Ready).await;
    let bob_frames = pump(&mut bob, &mut bob_inbox).await;
    assert!(bob_frames.iter().any(|f| matches!(f, ServerCommand::Ready(Ok(_)))));
    assert!(
        bob_frames.iter().any(|f| matches!(f, ServerCommand::ChangeState(Some(RoomState::Playing)))),
        "once every non-monitor player is ready the room should start playing: {bob_frames:?}",
    );
    let alice_frames = pump(&mut alice, &mut alice_inbox).await;
    assert!(
        alice_frames.iter().any(|f| matches!(f, ServerCommand::ChangeState(Some(RoomState::Playing)))),
        "the owner should also observe the room transition to Playing: {alice_frames:?}",
    );
}
