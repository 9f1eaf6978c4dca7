//! Shared scaffolding for the top-level integration tests: an in-memory
//! `Outbox` that records every frame sent to a connection so tests can
//! decode and assert on them, plus a one-call server builder wired the same
//! way `main.rs` wires the real collaborators.

use async_trait::async_trait;
use bytes::Bytes;
use phi_session_server::auth_client::StaticAuthClient;
use phi_session_server::ban_store::InMemoryBanStore;
use phi_session_server::chart_service::StaticChartService;
use phi_session_server::codec::server::ServerCommand;
use phi_session_server::metrics::ServerMetrics;
use phi_session_server::protocol_engine::{Outbox, ProtocolEngine};
use phi_session_server::room::{RoomStore, UserInfo};
use phi_session_server::session::SessionTable;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct RecordingOutbox {
    sent: Mutex<HashMap<u64, Vec<ServerCommand>>>,
    closed: Mutex<Vec<u64>>,
}

#[async_trait]
impl Outbox for RecordingOutbox {
    async fn send(&self, connection_id: u64, frame: Bytes) {
        let cmd = ServerCommand::decode(&frame).expect("server frame must decode");
        self.sent.lock().await.entry(connection_id).or_default().push(cmd);
    }

    async fn close(&self, connection_id: u64) {
        self.closed.lock().await.push(connection_id);
    }
}

impl RecordingOutbox {
    pub async fn drain(&self, connection_id: u64) -> Vec<ServerCommand> {
        self.sent.lock().await.remove(&connection_id).unwrap_or_default()
    }

    pub async fn closed_connections(&self) -> Vec<u64> {
        self.closed.lock().await.clone()
    }
}

pub const TOKEN_LENGTH: usize = 20;

fn token_for(user_id: i32) -> String {
    format!("user-{user_id:0>15}")
}

/// Builds a `ProtocolEngine` with `StaticAuthClient`/`StaticChartService`/
/// `InMemoryBanStore` test doubles and a `RecordingOutbox`, the same
/// collaborator shape `main.rs` assembles from real HTTP clients. Every
/// `(id, name)` pair in `players` gets a distinct fixed-length token,
/// returned alongside the engine so tests can drive `Authenticate` commands.
pub async fn build_test_server(
    chart_id: i32,
    room_size: u8,
    players: &[(i32, &str)],
) -> (Arc<ProtocolEngine>, Arc<RecordingOutbox>, HashMap<i32, String>) {
    let sessions = SessionTable::new();
    let rooms = RoomStore::new();
    let auth = Arc::new(StaticAuthClient::default());
    let charts = Arc::new(StaticChartService::with_chart(chart_id, "Test Chart"));
    let bans = Arc::new(InMemoryBanStore::new());
    let metrics = Arc::new(ServerMetrics::new());
    let outbox = Arc::new(RecordingOutbox::default());

    let mut tokens = HashMap::new();
    for (id, name) in players {
        let token = token_for(*id);
        auth.insert(&token, UserInfo { id: *id, name: name.to_string(), monitor: false });
        tokens.insert(*id, token);
    }

    let engine = ProtocolEngine::new(
        sessions,
        rooms,
        auth,
        charts,
        bans,
        metrics,
        outbox.clone(),
        TOKEN_LENGTH,
        room_size,
    );

    (engine, outbox, tokens)
}
