//! TCP transport: the length-prefixed binary wire, per-connection tasks, and
//! the heartbeat/timeout loop (§4.2, §4.6).
//!
//! Mirrors the split send/receive task shape of the teacher's
//! `websocket/connection.rs`: one task drains a bounded outbound channel and
//! writes framed bytes to the socket, another reads the socket into a
//! growable buffer and repeatedly pulls complete frames out of it with
//! [`crate::codec::try_extract_frame`]. `ConnectionRegistry` plays the role
//! of `server/connection_manager.rs`'s `DashMap` registry, and is the only
//! place in the crate that reaches for `dashmap` rather than the ordered
//! locks documented in `crate::room`.

use crate::codec::client::ClientCommand;
use crate::codec::server::ServerCommand;
use crate::codec::{self, DecodeError};
use crate::metrics::ServerMetrics;
use crate::protocol_engine::{Outbox, ProtocolEngine};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bound on a connection's outbound queue. A full queue means the socket is
/// backed up; we drop the frame and count it rather than block the engine
/// (`crate::broadcast` fan-out must never stall on one slow peer).
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Growth increment for the per-connection read buffer.
const READ_BUF_CHUNK: usize = 4096;

/// Destination for frames addressed to a connection id the registry itself
/// has no socket for — specifically, the virtual connection ids federation
/// mints for cross-node proxy players (`crate::federation`). Injected after
/// construction, same pattern as `protocol_engine::FederationRouter`.
#[async_trait]
pub trait ProxySink: Send + Sync {
    async fn deliver(&self, connection_id: u64, frame: Bytes);
}

/// Maps live connection ids to the sender half of their outbound channel.
///
/// The only collection in the crate backed by `dashmap` rather than the
/// `SessionTable -> RoomStore -> Federation` lock order (§5) — it sits below
/// all three, touched only to push bytes at a socket.
#[derive(Default)]
pub struct ConnectionRegistry {
    senders: DashMap<u64, mpsc::Sender<Bytes>>,
    next_id: AtomicU64,
    proxy_sink: RwLock<Option<Arc<dyn ProxySink>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wires in the federation proxy sink; main.rs calls this once both
    /// collaborators exist, mirroring `ProtocolEngine::set_federation_router`.
    pub async fn set_proxy_sink(&self, sink: Arc<dyn ProxySink>) {
        *self.proxy_sink.write().await = Some(sink);
    }

    fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, connection_id: u64, sender: mpsc::Sender<Bytes>) {
        self.senders.insert(connection_id, sender);
    }

    fn remove(&self, connection_id: u64) {
        self.senders.remove(&connection_id);
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: u64) -> bool {
        self.senders.contains_key(&connection_id)
    }
}

#[async_trait]
impl Outbox for ConnectionRegistry {
    /// `frame` is the unframed `ServerCommand::encode()` payload; the length
    /// prefix is applied here, once, right before it reaches the channel.
    async fn send(&self, connection_id: u64, frame: Bytes) {
        let Some(sender) = self.senders.get(&connection_id).map(|e| e.value().clone()) else {
            let sink = self.proxy_sink.read().await.clone();
            if let Some(sink) = sink {
                sink.deliver(connection_id, frame).await;
            }
            return;
        };
        let framed = Bytes::from(codec::frame(&frame));
        if let Err(err) = sender.try_send(framed) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(connection_id, "outbound queue full, dropping frame");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(connection_id, "outbound channel closed, dropping frame");
                }
            }
        }
    }

    /// Drops the stored sender half. Once no clone of it survives, the
    /// connection's write task sees its channel close, stops, and shuts the
    /// socket's write half down — the peer observes a closed connection on
    /// its next read or write. A no-op for virtual (federated proxy)
    /// connection ids, which have no local socket to close.
    async fn close(&self, connection_id: u64) {
        self.senders.remove(&connection_id);
    }
}

/// Serves connections accepted from `listener` until it errors. Takes an
/// already-bound listener (rather than a `SocketAddr`) so callers — tests in
/// particular — can bind to port 0 and read back the OS-assigned port via
/// `TcpListener::local_addr()` before handing it off.
pub async fn run(
    listener: TcpListener,
    engine: Arc<ProtocolEngine>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "TCP transport listening");

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let connection_id = registry.next_connection_id();
        let engine = engine.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            handle_connection(
                socket,
                peer_addr,
                connection_id,
                engine,
                registry,
                metrics,
                heartbeat_interval,
                heartbeat_timeout,
            )
            .await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    connection_id: u64,
    engine: Arc<ProtocolEngine>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    if let Err(err) = socket.set_nodelay(true) {
        debug!(connection_id, %err, "failed to set TCP_NODELAY");
    }

    let mut version = [0u8; 1];
    if socket.read_exact(&mut version).await.is_err() {
        debug!(connection_id, %peer_addr, "connection closed before version handshake");
        return;
    }
    if version[0] != codec::PROTOCOL_VERSION {
        warn!(
            connection_id,
            %peer_addr,
            got = version[0],
            expected = codec::PROTOCOL_VERSION,
            "client sent an unexpected protocol version; continuing anyway"
        );
    }

    let (read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_CAPACITY);
    registry.register(connection_id, tx);
    metrics.increment_connections();
    info!(connection_id, %peer_addr, "connection established");

    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    run_read_loop(
        read_half,
        peer_addr,
        connection_id,
        &engine,
        &registry,
        &metrics,
        heartbeat_interval,
        heartbeat_timeout,
    )
    .await;

    registry.remove(connection_id);
    write_task.abort();
    engine.run_disconnect(connection_id).await;
    metrics.decrement_active_connections();
    info!(connection_id, "connection closed");
}

async fn run_read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    peer_addr: SocketAddr,
    connection_id: u64,
    engine: &Arc<ProtocolEngine>,
    registry: &Arc<ConnectionRegistry>,
    metrics: &Arc<ServerMetrics>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_BUF_CHUNK);
    let mut filled = 0usize;
    let mut last_activity = Instant::now();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; consume it so the cadence starts from
    // `heartbeat_interval` after connect rather than probing right away.
    heartbeat.tick().await;

    loop {
        if buf.len() - filled < READ_BUF_CHUNK {
            buf.resize(buf.len() + READ_BUF_CHUNK, 0);
        }

        tokio::select! {
            read_result = read_half.read(&mut buf[filled..]) => {
                match read_result {
                    Ok(0) => {
                        debug!(connection_id, "peer closed connection");
                        return;
                    }
                    Ok(n) => {
                        filled += n;
                        last_activity = Instant::now();
                        if !drain_frames(&mut buf, &mut filled, connection_id, peer_addr, engine, metrics).await {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(connection_id, %err, "socket read error");
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= heartbeat_interval + heartbeat_timeout {
                    warn!(connection_id, "heartbeat timeout, closing connection");
                    return;
                }
                registry
                    .send(connection_id, Bytes::from(ServerCommand::Pong.encode()))
                    .await;
            }
        }
    }
}

/// Pulls every complete frame currently buffered and dispatches it. Returns
/// `false` if the connection should be closed (malformed length prefix).
async fn drain_frames(
    buf: &mut Vec<u8>,
    filled: &mut usize,
    connection_id: u64,
    peer_addr: SocketAddr,
    engine: &Arc<ProtocolEngine>,
    metrics: &Arc<ServerMetrics>,
) -> bool {
    let mut consumed = 0usize;

    loop {
        match codec::try_extract_frame(&buf[consumed..*filled]) {
            Ok(Some((start, end))) => {
                let payload = &buf[consumed + start..consumed + end];
                match ClientCommand::decode(payload) {
                    Ok(cmd) => engine.dispatch(connection_id, peer_addr, cmd).await,
                    Err(DecodeError::UnknownVariant(op)) => {
                        debug!(connection_id, opcode = op, "ignoring unknown client opcode");
                    }
                    Err(err) => {
                        metrics.increment_protocol_errors();
                        debug!(connection_id, %err, "dropping malformed client frame");
                    }
                }
                consumed += end;
            }
            Ok(None) => break,
            Err(err) => {
                warn!(connection_id, %err, "closing connection on frame error");
                return false;
            }
        }
    }

    if consumed > 0 {
        buf.copy_within(consumed..*filled, 0);
        *filled -= consumed;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_client::StaticAuthClient;
    use crate::ban_store::InMemoryBanStore;
    use crate::chart_service::StaticChartService;
    use crate::room::RoomStore;
    use crate::session::SessionTable;

    fn test_engine(registry: Arc<ConnectionRegistry>) -> Arc<ProtocolEngine> {
        ProtocolEngine::new(
            SessionTable::new(),
            RoomStore::new(),
            Arc::new(StaticAuthClient::single(1, "player-one")),
            Arc::new(StaticChartService::with_chart(1, "chart")),
            Arc::new(InMemoryBanStore::default()),
            Arc::new(ServerMetrics::new()),
            registry,
            20,
            8,
        )
    }

    #[test]
    fn registry_drops_frame_for_unknown_connection_without_panicking() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let registry = ConnectionRegistry::new();
            registry.send(42, Bytes::from_static(b"hello")).await;
            assert!(!registry.is_connected(42));
        });
    }

    #[tokio::test]
    async fn frames_can_round_trip_through_the_registry_channel() {
        let registry = ConnectionRegistry::new();
        let _engine = test_engine(registry.clone());
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(7, tx);
        assert!(registry.is_connected(7));

        registry.send(7, Bytes::from_static(&[0])).await;
        let framed = rx.recv().await.unwrap();
        let (start, end) = codec::try_extract_frame(&framed).unwrap().unwrap();
        assert_eq!(&framed[start..end], &[0]);

        registry.remove(7);
        assert!(!registry.is_connected(7));
    }

    #[test]
    fn drain_frames_consumes_multiple_buffered_frames() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let registry = ConnectionRegistry::new();
            let engine = test_engine(registry);
            let metrics = Arc::new(ServerMetrics::new());

            let ping = crate::codec::client::ClientCommand::Ping;
            let mut wire = codec::frame(&ping.encode());
            wire.extend(codec::frame(&ping.encode()));
            let mut buf = wire.clone();
            let mut filled = buf.len();

            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            let ok = drain_frames(&mut buf, &mut filled, 1, addr, &engine, &metrics).await;
            assert!(ok);
            assert_eq!(filled, 0);
        });
    }
}
