//! Cross-node federation (§4.5): peer discovery, health checks, room-catalog
//! gossip, and the request/reply proxy that lets a player on one node sit in
//! a room hosted by another.
//!
//! Wired into [`crate::protocol_engine::ProtocolEngine`] two ways, mirroring
//! the narrow injected-trait pattern the engine already uses for `Outbox`:
//! `Federation` holds an `Arc<dyn EngineHandle>` to run virtual sessions for
//! inbound proxy players, and implements
//! [`crate::protocol_engine::FederationRouter`] so the engine can hand it
//! outbound `JoinRoom`s the local catalog doesn't recognize. Both are
//! injected after construction, so neither module borrows the other's
//! concrete type.

use crate::codec::client::ClientCommand;
use crate::codec::server::{Message, ServerCommand};
use crate::config::FederationConfig;
use crate::errors::FederationError;
use crate::metrics::ServerMetrics;
use crate::protocol_engine::{EngineHandle, FederationRouter};
use crate::room::{RoomState, RoomStore, UserInfo};
use crate::transport::ProxySink;
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Marks connection ids minted for inbound proxy players so they never
/// collide with the transport's own monotonic counter (`ConnectionRegistry`
/// starts at 0 and will not realistically reach this range).
const VIRTUAL_CONNECTION_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationNode {
    pub id: String,
    pub url: String,
    pub server_name: String,
    pub status: NodeStatus,
    pub last_seen: i64,
    pub last_health_check: i64,
    pub added_at: i64,
    #[serde(skip)]
    consecutive_failures: u32,
    #[serde(skip)]
    offline_since: Option<i64>,
}

/// Narrower shape persisted to `federation_nodes[<suffix>].json` (§6) —
/// health-check derived fields are re-derived at startup, not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedNode {
    id: String,
    url: String,
    #[serde(rename = "serverName")]
    server_name: String,
    #[serde(rename = "lastSeen")]
    last_seen: i64,
    #[serde(rename = "addedAt")]
    added_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub player_count: u8,
    pub max_players: u8,
    pub state: String,
    pub locked: bool,
    pub selected_chart: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub url: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "nodeUrl")]
    pub node_url: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(default, rename = "isReverse")]
    pub is_reverse: bool,
}

#[derive(Debug, Serialize)]
pub struct HandshakeResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub status: &'static str,
    pub peers: Vec<PeerSummary>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct RoomsResponse {
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoomEventKind {
    Created,
    Updated,
    Deleted,
    StateChanged,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: RoomEventKind,
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub data: Option<RoomSummary>,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProxyJoinRequest {
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    #[serde(rename = "sourceNodeUrl")]
    pub source_node_url: String,
    pub user: UserInfo,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub monitor: bool,
}

#[derive(Debug, Serialize)]
pub struct ProxyJoinResponse {
    pub ok: bool,
    pub error: Option<String>,
    /// Base64 of the `ServerCommand::JoinRoom` reply frame sent to the
    /// virtual connection while handling this call, when one was produced
    /// synchronously. Anything emitted afterward travels over `/proxy/callback`.
    #[serde(rename = "initialFrame")]
    pub initial_frame: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyCommandRequest {
    #[serde(rename = "connectionId")]
    pub connection_id: u64,
    pub frame: String,
}

#[derive(Debug, Deserialize)]
pub struct ProxyLeaveRequest {
    #[serde(rename = "connectionId")]
    pub connection_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct ProxyCallbackRequest {
    #[serde(rename = "userId")]
    pub user_id: i32,
    pub frame: String,
}

struct InboundProxyConnection {
    source_node_id: String,
    source_node_url: String,
    user_id: i32,
    /// Filled in by `deliver()` for the very first frame sent to this
    /// virtual connection while `handle_proxy_join` is still running, so
    /// the join response can carry it inline; cleared once read.
    first_frame: Option<Arc<Mutex<Option<Bytes>>>>,
}

struct OutboundProxySession {
    node_id: String,
    node_url: String,
    #[allow(dead_code)]
    room_id: String,
    user_id: i32,
}

/// Cross-node federation state: the peer table, the remote room-catalog
/// cache, and the bookkeeping for proxied players in both directions.
pub struct Federation {
    config: FederationConfig,
    http: reqwest::Client,
    server_name: String,
    node_id: String,
    data_dir: PathBuf,
    nodes: RwLock<HashMap<String, FederationNode>>,
    remote_rooms: RwLock<HashMap<String, Vec<RoomSummary>>>,
    room_owner: RwLock<HashMap<String, String>>,
    engine: RwLock<Option<Arc<dyn EngineHandle>>>,
    metrics: Arc<ServerMetrics>,
    next_virtual_id: AtomicU64,
    inbound: RwLock<HashMap<u64, InboundProxyConnection>>,
    outbound: RwLock<HashMap<u64, OutboundProxySession>>,
}

fn url_suffix(node_url: &str) -> String {
    node_url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl Federation {
    /// Builds the federation state, loading (or minting) this node's id and
    /// whatever peer table was persisted under `data_dir`.
    #[must_use]
    pub fn new(
        config: FederationConfig,
        data_dir: impl Into<PathBuf>,
        server_name: String,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        let data_dir = data_dir.into();
        let suffix = url_suffix(&config.node_url);
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| load_or_create_node_id(&data_dir, &suffix));
        let persisted = load_persisted_nodes(&data_dir, &suffix);

        let mut nodes = HashMap::new();
        for p in persisted {
            nodes.insert(
                p.id.clone(),
                FederationNode {
                    id: p.id,
                    url: p.url,
                    server_name: p.server_name,
                    status: NodeStatus::Unknown,
                    last_seen: p.last_seen,
                    last_health_check: 0,
                    added_at: p.added_at,
                    consecutive_failures: 0,
                    offline_since: None,
                },
            );
        }

        let http = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Arc::new(Self {
            config,
            http,
            server_name,
            node_id,
            data_dir,
            nodes: RwLock::new(nodes),
            remote_rooms: RwLock::new(HashMap::new()),
            room_owner: RwLock::new(HashMap::new()),
            engine: RwLock::new(None),
            metrics,
            next_virtual_id: AtomicU64::new(0),
            inbound: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Builds the `/api/federation/health` response the web bridge serves.
    pub async fn health_response(&self) -> HealthResponse {
        HealthResponse {
            node_id: self.node_id.clone(),
            server_name: self.server_name.clone(),
            status: "online",
            peers: self.peer_summaries().await,
            timestamp: now_ms(),
        }
    }

    /// Builds the `/api/federation/rooms` response: this node's own visible
    /// catalog, served to a peer pulling room state during sync.
    pub async fn rooms_response(&self, rooms: &RoomStore) -> RoomsResponse {
        RoomsResponse { rooms: self.local_room_catalog(rooms).await }
    }

    /// Constant-time check of the `X-Federation-Secret` header the web
    /// bridge receives against the configured shared secret.
    #[must_use]
    pub fn verify_secret(&self, provided: &str) -> bool {
        use subtle::ConstantTimeEq;
        self.config.secret.as_bytes().ct_eq(provided.as_bytes()).into()
    }

    pub async fn set_engine_handle(&self, handle: Arc<dyn EngineHandle>) {
        *self.engine.write().await = Some(handle);
    }

    async fn engine(&self) -> Option<Arc<dyn EngineHandle>> {
        self.engine.read().await.clone()
    }

    fn federation_header(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-Federation-Secret", &self.config.secret)
    }

    async fn persist_nodes(&self) {
        let nodes = self.nodes.read().await;
        let persisted: Vec<PersistedNode> = nodes
            .values()
            .map(|n| PersistedNode {
                id: n.id.clone(),
                url: n.url.clone(),
                server_name: n.server_name.clone(),
                last_seen: n.last_seen,
                added_at: n.added_at,
            })
            .collect();
        drop(nodes);
        let suffix = url_suffix(&self.config.node_url);
        let path = self.data_dir.join(format!("federation_nodes[{suffix}].json"));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&persisted) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&path, json) {
                    warn!(error = %err, path = %path.display(), "failed to persist federation node table");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize federation node table"),
        }
    }

    async fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.nodes
            .read()
            .await
            .values()
            .map(|n| PeerSummary { id: n.id.clone(), url: n.url.clone(), server_name: n.server_name.clone() })
            .collect()
    }

    async fn upsert_node(&self, id: String, url: String, server_name: String) -> Result<bool, FederationError> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&id) {
            if existing.url != url && !existing.url.is_empty() {
                return Err(FederationError::IdCollision(id));
            }
        }
        let now = now_ms();
        let is_new = !nodes.contains_key(&id);
        nodes
            .entry(id.clone())
            .and_modify(|n| {
                n.url = url.clone();
                n.server_name = server_name.clone();
                n.status = NodeStatus::Online;
                n.last_seen = now;
                n.consecutive_failures = 0;
                n.offline_since = None;
            })
            .or_insert_with(|| FederationNode {
                id,
                url,
                server_name,
                status: NodeStatus::Online,
                last_seen: now,
                last_health_check: now,
                added_at: now,
                consecutive_failures: 0,
                offline_since: None,
            });
        drop(nodes);
        self.persist_nodes().await;
        Ok(is_new)
    }

    // -- Handshake --------------------------------------------------------

    /// Bootstraps by handshaking every configured seed node. Spawned once
    /// at startup; failures are logged and retried on the next health tick.
    pub fn spawn_bootstrap(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        for seed in self.config.seed_nodes.clone() {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.call_handshake(&seed, false).await {
                    warn!(node_url = %seed, error = %err, "seed handshake failed");
                    this.metrics.increment_federation_handshake_failures();
                }
            });
        }
    }

    /// Server-side: another node is handshaking with us.
    pub async fn handle_handshake(
        self: &Arc<Self>,
        req: HandshakeRequest,
    ) -> Result<HandshakeResponse, FederationError> {
        let is_new = self.upsert_node(req.node_id.clone(), req.node_url.clone(), req.server_name.clone()).await?;
        self.metrics.increment_federation_received();

        if is_new && !req.is_reverse {
            let this = self.clone();
            let peer_url = req.node_url.clone();
            let node_id = req.node_id.clone();
            // Fire the reverse handshake without blocking our own response.
            tokio::spawn(async move {
                if let Err(err) = this.call_handshake(&peer_url, true).await {
                    warn!(node_id, error = %err, "reverse handshake failed");
                }
            });
        }

        Ok(HandshakeResponse {
            node_id: self.node_id.clone(),
            server_name: self.server_name.clone(),
            peers: self.peer_summaries().await,
        })
    }

    /// Client-side: call a peer's `/handshake` and absorb its peer list.
    pub async fn call_handshake(self: &Arc<Self>, peer_url: &str, is_reverse: bool) -> Result<(), FederationError> {
        let body = HandshakeRequest {
            node_id: self.node_id.clone(),
            node_url: self.config.node_url.clone(),
            server_name: self.server_name.clone(),
            is_reverse,
        };
        let resp = self
            .federation_header(self.http.post(format!("{}/api/federation/handshake", peer_url.trim_end_matches('/'))))
            .timeout(Duration::from_secs(self.config.handshake_timeout_secs))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FederationError::PeerError(format!("handshake rejected with {}", resp.status())));
        }
        let parsed: HandshakeResponse = resp.json().await?;
        self.upsert_node(parsed.node_id.clone(), peer_url.to_string(), parsed.server_name).await?;
        self.metrics.increment_federation_sent();
        info!(peer_node_id = %parsed.node_id, %peer_url, "federation handshake complete");

        for peer in parsed.peers {
            let known = self.nodes.read().await.contains_key(&peer.id);
            if !known && peer.id != self.node_id {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = this.call_handshake(&peer.url, false).await {
                        debug!(peer_url = %peer.url, error = %err, "gossip-discovered peer handshake failed");
                    }
                });
            }
        }

        self.sync_one(&parsed_node_id_or(self, peer_url).await).await;
        Ok(())
    }

    // -- Health loop --------------------------------------------------------

    /// Runs until cancelled (intended to be spawned once at startup).
    pub async fn run_health_loop(self: Arc<Self>, rooms: Arc<RoomStore>) {
        if !self.config.enabled {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.health_interval_secs.max(1)));
        loop {
            interval.tick().await;
            self.health_check_once(&rooms).await;
        }
    }

    async fn health_check_once(&self, rooms: &Arc<RoomStore>) {
        let ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        for id in ids {
            if self.purge_if_stale(&id).await {
                continue;
            }
            self.probe_node(&id, rooms).await;
        }
        self.persist_nodes().await;
    }

    /// Removes a node that has been offline past `offline_purge_days` (§4.5:
    /// "...then purged"), along with its cached room catalog and any
    /// ownership entries pointing at it. Returns `true` if the node was
    /// purged, so the caller skips probing it this cycle.
    async fn purge_if_stale(&self, id: &str) -> bool {
        let purge_after_ms = self.config.offline_purge_days.saturating_mul(24 * 3600 * 1000) as i64;
        let stale = {
            let nodes = self.nodes.read().await;
            let Some(node) = nodes.get(id) else { return false };
            node.status == NodeStatus::Offline
                && node.offline_since.is_some_and(|since| now_ms() - since >= purge_after_ms)
        };
        if !stale {
            return false;
        }
        warn!(node_id = id, "federation peer offline past purge threshold, removing from peer table");
        self.nodes.write().await.remove(id);
        self.remote_rooms.write().await.remove(id);
        self.room_owner.write().await.retain(|_, owner| owner != id);
        true
    }

    async fn probe_node(&self, id: &str, rooms: &Arc<RoomStore>) {
        let (url, should_probe) = {
            let nodes = self.nodes.read().await;
            let Some(node) = nodes.get(id) else { return };
            (node.url.clone(), self.due_for_probe(node))
        };
        if !should_probe {
            return;
        }

        let result = self
            .federation_header(self.http.get(format!("{}/api/federation/health", url.trim_end_matches('/'))))
            .timeout(Duration::from_secs(self.config.health_timeout_secs))
            .send()
            .await;

        let was_offline = {
            let nodes = self.nodes.read().await;
            nodes.get(id).map(|n| n.status == NodeStatus::Offline).unwrap_or(false)
        };

        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else { return };
        let now = now_ms();
        node.last_health_check = now;
        match result {
            Ok(resp) if resp.status().is_success() => {
                node.status = NodeStatus::Online;
                node.last_seen = now;
                node.consecutive_failures = 0;
                node.offline_since = None;
            }
            _ => {
                node.consecutive_failures += 1;
                if node.status != NodeStatus::Offline {
                    node.status = NodeStatus::Offline;
                    node.offline_since = Some(now);
                }
            }
        }
        let now_online = node.status == NodeStatus::Online;
        drop(nodes);

        if was_offline && now_online {
            info!(node_id = id, "federation peer back online, re-syncing its room catalog");
            self.sync_one(id).await;
        } else if !was_offline && !now_online {
            warn!(node_id = id, "federation peer went offline, detaching its proxy players");
            self.detach_node(id).await;
        }
        let _ = rooms;
    }

    /// Offline back-off schedule (§4.5): every cycle while online/unknown,
    /// 5 minutes for the first 3 days offline, 1 hour after that, until
    /// `offline_purge_days` is reached — at which point `purge_if_stale`
    /// removes the node entirely and this is moot.
    fn due_for_probe(&self, node: &FederationNode) -> bool {
        let Some(offline_since) = node.offline_since else { return true };
        if node.status != NodeStatus::Offline {
            return true;
        }
        let offline_for = Duration::from_millis((now_ms() - offline_since).max(0) as u64);
        let three_days = Duration::from_secs(3 * 24 * 3600);
        let purge_after = Duration::from_secs(self.config.offline_purge_days.saturating_mul(24 * 3600));
        if offline_for >= purge_after {
            return false;
        }
        let backoff = if offline_for < three_days { Duration::from_secs(300) } else { Duration::from_secs(3600) };
        let since_last_check = Duration::from_millis((now_ms() - node.last_health_check).max(0) as u64);
        since_last_check >= backoff
    }

    /// A peer went offline: drop incoming federated players it sourced and
    /// forcibly detach any of our local players proxied into its rooms.
    async fn detach_node(&self, node_id: &str) {
        let Some(engine) = self.engine().await else { return };

        let inbound_ids: Vec<u64> = {
            let inbound = self.inbound.read().await;
            inbound.iter().filter(|(_, c)| c.source_node_id == node_id).map(|(id, _)| *id).collect()
        };
        for vid in inbound_ids {
            engine.handle_disconnection(vid).await;
            self.inbound.write().await.remove(&vid);
        }

        // Local players proxied onto the dead node lose their outbound route
        // and are notified directly, rather than waiting for their next
        // command to discover `forward_if_remote` no longer finds an entry.
        let outbound_targets: Vec<(u64, i32)> = {
            let outbound = self.outbound.read().await;
            outbound
                .iter()
                .filter(|(_, s)| s.node_id == node_id)
                .map(|(conn, s)| (*conn, s.user_id))
                .collect()
        };
        for (conn_id, user_id) in outbound_targets {
            self.outbound.write().await.remove(&conn_id);
            engine
                .send_command_to_user(
                    user_id,
                    ServerCommand::Message(Message::Chat {
                        user: crate::room::SERVER_BOT_USER_ID,
                        content: "远程节点已离线，房间连接已断开".to_string(),
                    }),
                )
                .await;
        }

        self.remote_rooms.write().await.remove(node_id);
        self.room_owner.write().await.retain(|_, owner| owner != node_id);
        self.metrics.increment_federation_proxy_errors();
    }

    // -- Room catalog sync --------------------------------------------------

    pub async fn run_sync_loop(self: Arc<Self>, rooms: Arc<RoomStore>) {
        if !self.config.enabled {
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        loop {
            interval.tick().await;
            self.sync_all(&rooms).await;
        }
    }

    async fn sync_all(&self, _rooms: &Arc<RoomStore>) {
        let ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        for id in ids {
            self.sync_one(&id).await;
        }
    }

    /// Pulls `/rooms` from one peer and replaces its cached catalog
    /// atomically. A network error preserves whatever was cached before.
    async fn sync_one(&self, node_id: &str) {
        let (url, online) = {
            let nodes = self.nodes.read().await;
            let Some(node) = nodes.get(node_id) else { return };
            (node.url.clone(), node.status != NodeStatus::Offline)
        };
        if !online {
            return;
        }

        let result = self
            .federation_header(self.http.get(format!("{}/api/federation/rooms", url.trim_end_matches('/'))))
            .timeout(Duration::from_secs(self.config.sync_timeout_secs))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<RoomsResponse>().await {
                Ok(parsed) => {
                    let mut owner = self.room_owner.write().await;
                    owner.retain(|_, owner_id| owner_id != node_id);
                    for room in &parsed.rooms {
                        owner.insert(room.id.clone(), node_id.to_string());
                    }
                    drop(owner);
                    self.remote_rooms.write().await.insert(node_id.to_string(), parsed.rooms);
                }
                Err(err) => debug!(node_id, error = %err, "malformed /rooms response, keeping previous catalog"),
            },
            Ok(resp) => debug!(node_id, status = %resp.status(), "peer rejected /rooms, keeping previous catalog"),
            Err(err) => debug!(node_id, error = %err, "peer unreachable for room sync, keeping previous catalog"),
        }
    }

    /// Local rooms, filtered to the visible set, for serving `/rooms` to a
    /// peer pulling our catalog.
    pub async fn local_room_catalog(&self, rooms: &RoomStore) -> Vec<RoomSummary> {
        let mut out = Vec::new();
        for id in rooms.list_ids().await {
            if let Some(room) = rooms.get(&id).await {
                out.push(RoomSummary {
                    id: room.id.clone(),
                    player_count: room.active_player_count() as u8,
                    max_players: room.max_players,
                    state: room.state.label().to_string(),
                    locked: room.locked,
                    selected_chart: room.selected_chart,
                });
            }
        }
        out
    }

    /// Every known remote room, annotated with nothing beyond what `/rooms`
    /// already exposes — used by the web bridge's combined catalog view.
    pub async fn remote_room_catalog(&self) -> Vec<RoomSummary> {
        self.remote_rooms.read().await.values().flatten().cloned().collect()
    }

    pub async fn handle_event(&self, event: RoomEvent) {
        self.metrics.increment_federation_received();
        let mut remote = self.remote_rooms.write().await;
        let entry = remote.entry(event.source_node_id.clone()).or_default();
        entry.retain(|r| r.id != event.room_id);
        if let Some(data) = event.data {
            entry.push(data);
            self.room_owner.write().await.insert(event.room_id, event.source_node_id);
        } else {
            self.room_owner.write().await.remove(&event.room_id);
        }
    }

    /// Best-effort fan-out of a local room change to every online peer.
    pub async fn push_event(&self, room_id: &str, kind: RoomEventKind, data: Option<RoomSummary>) {
        if !self.config.enabled {
            return;
        }
        let event = RoomEvent {
            kind,
            source_node_id: self.node_id.clone(),
            room_id: room_id.to_string(),
            data,
            timestamp: now_ms(),
        };
        let Ok(body) = serde_json::to_string(&event) else { return };
        let peers: Vec<String> = {
            let nodes = self.nodes.read().await;
            nodes.values().filter(|n| n.status != NodeStatus::Offline).map(|n| n.url.clone()).collect()
        };
        for url in peers {
            let http = self.http.clone();
            let secret = self.config.secret.clone();
            let body = body.clone();
            let timeout = Duration::from_secs(self.config.event_timeout_secs);
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let result = http
                    .post(format!("{}/api/federation/event", url.trim_end_matches('/')))
                    .header("X-Federation-Secret", secret)
                    .header("content-type", "application/json")
                    .timeout(timeout)
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => metrics.increment_federation_sent(),
                    _ => metrics.increment_federation_proxy_errors(),
                }
            });
        }
    }

    // -- Cross-node proxy: inbound (we are authoritative) -------------------

    fn mint_virtual_connection_id(&self) -> u64 {
        VIRTUAL_CONNECTION_BIT | self.next_virtual_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn handle_proxy_join(&self, req: ProxyJoinRequest) -> ProxyJoinResponse {
        let Some(engine) = self.engine().await else {
            return ProxyJoinResponse { ok: false, error: Some("federation not ready".into()), initial_frame: None };
        };

        let vid = self.mint_virtual_connection_id();
        let capture = Arc::new(Mutex::new(None));
        self.inbound.write().await.insert(
            vid,
            InboundProxyConnection {
                source_node_id: req.source_node_id.clone(),
                source_node_url: req.source_node_url.clone(),
                user_id: req.user.id,
                first_frame: Some(capture.clone()),
            },
        );

        let dummy_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        engine.create_federated_session(vid, req.user, dummy_addr).await;
        engine
            .handle_message(vid, ClientCommand::JoinRoom { id: req.room_id, monitor: req.monitor })
            .await;

        if let Some(entry) = self.inbound.write().await.get_mut(&vid) {
            entry.first_frame = None;
        }
        let initial = capture.lock().await.take();

        ProxyJoinResponse {
            ok: true,
            error: None,
            initial_frame: initial.map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
        }
    }

    pub async fn handle_proxy_command(&self, req: ProxyCommandRequest) -> Result<(), String> {
        let Some(engine) = self.engine().await else { return Err("federation not ready".into()) };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(req.frame)
            .map_err(|e| e.to_string())?;
        let cmd = ClientCommand::decode(&bytes).map_err(|e| e.to_string())?;
        engine.handle_message(req.connection_id, cmd).await;
        Ok(())
    }

    pub async fn handle_proxy_leave(&self, req: ProxyLeaveRequest) {
        if let Some(engine) = self.engine().await {
            engine.handle_disconnection(req.connection_id).await;
        }
        self.inbound.write().await.remove(&req.connection_id);
    }

    pub async fn handle_proxy_callback(&self, req: ProxyCallbackRequest) {
        let Some(engine) = self.engine().await else { return };
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(req.frame) else { return };
        let Ok(cmd) = ServerCommand::decode(&bytes) else { return };
        engine.send_command_to_user(req.user_id, cmd).await;
    }

    // -- Cross-node proxy: outbound (we are the source node) ----------------

    async fn owner_url_of(&self, room_id: &str) -> Option<String> {
        let owner_id = self.room_owner.read().await.get(room_id).cloned()?;
        self.nodes.read().await.get(&owner_id).map(|n| n.url.clone())
    }
}

#[async_trait]
impl FederationRouter for Federation {
    async fn forward_if_remote(&self, connection_id: u64, cmd: &ClientCommand) -> bool {
        let route = {
            let outbound = self.outbound.read().await;
            outbound.get(&connection_id).map(|s| s.node_url.clone())
        };
        let Some(node_url) = route else { return false };

        if matches!(cmd, ClientCommand::LeaveRoom) {
            self.outbound.write().await.remove(&connection_id);
        }

        let frame = base64::engine::general_purpose::STANDARD.encode(cmd.encode());
        let http = self.http.clone();
        let secret = self.config.secret.clone();
        let timeout = Duration::from_secs(self.config.proxy_timeout_secs);
        let endpoint = if matches!(cmd, ClientCommand::LeaveRoom) { "leave" } else { "command" };
        let body = if endpoint == "leave" {
            serde_json::json!({ "connectionId": connection_id })
        } else {
            serde_json::json!({ "connectionId": connection_id, "frame": frame })
        };
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let result = http
                .post(format!("{}/api/federation/proxy/{endpoint}", node_url.trim_end_matches('/')))
                .header("X-Federation-Secret", secret)
                .timeout(timeout)
                .json(&body)
                .send()
                .await;
            if result.is_err() {
                metrics.increment_federation_proxy_errors();
            }
        });
        true
    }

    async fn try_join_remote_room(
        &self,
        connection_id: u64,
        user: UserInfo,
        room_id: String,
        monitor: bool,
    ) -> Option<()> {
        let node_url = self.owner_url_of(&room_id).await?;
        let node_id = self.room_owner.read().await.get(&room_id).cloned()?;
        let user_id = user.id;

        let body = ProxyJoinRequest {
            source_node_id: self.node_id.clone(),
            source_node_url: self.config.node_url.clone(),
            user,
            room_id: room_id.clone(),
            monitor,
        };

        let resp = self
            .federation_header(self.http.post(format!("{}/api/federation/proxy/join", node_url.trim_end_matches('/'))))
            .timeout(Duration::from_secs(self.config.proxy_timeout_secs))
            .json(&body)
            .send()
            .await
            .ok()?;
        let parsed: ProxyJoinResponse = resp.json().await.ok()?;
        if !parsed.ok {
            return None;
        }

        self.outbound
            .write()
            .await
            .insert(connection_id, OutboundProxySession { node_id, node_url, room_id, user_id });

        if let Some(frame_b64) = parsed.initial_frame {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(frame_b64) {
                if let (Ok(cmd), Some(engine)) = (ServerCommand::decode(&bytes), self.engine().await) {
                    engine.send_command_to_user(user_id, cmd).await;
                }
            }
        }
        Some(())
    }
}

#[async_trait]
impl ProxySink for Federation {
    async fn deliver(&self, connection_id: u64, frame: Bytes) {
        let (source_url, user_id, capture) = {
            let inbound = self.inbound.read().await;
            let Some(route) = inbound.get(&connection_id) else { return };
            (route.source_node_url.clone(), route.user_id, route.first_frame.clone())
        };

        if let Some(slot) = capture {
            let mut guard = slot.lock().await;
            if guard.is_none() {
                *guard = Some(frame);
                return;
            }
        }

        let body = serde_json::json!({
            "userId": user_id,
            "frame": base64::engine::general_purpose::STANDARD.encode(&frame),
        });
        let http = self.http.clone();
        let secret = self.config.secret.clone();
        let timeout = Duration::from_secs(self.config.event_timeout_secs);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let result = http
                .post(format!("{}/api/federation/proxy/callback", source_url.trim_end_matches('/')))
                .header("X-Federation-Secret", secret)
                .timeout(timeout)
                .json(&body)
                .send()
                .await;
            if result.is_err() {
                metrics.increment_federation_proxy_errors();
            }
        });
    }
}

async fn parsed_node_id_or(federation: &Federation, peer_url: &str) -> String {
    let nodes = federation.nodes.read().await;
    nodes
        .values()
        .find(|n| n.url == peer_url)
        .map(|n| n.id.clone())
        .unwrap_or_default()
}

fn load_or_create_node_id(data_dir: &Path, suffix: &str) -> String {
    let path = data_dir.join(format!("federation_id[{suffix}].txt"));
    if let Ok(contents) = std::fs::read_to_string(&path) {
        let id = contents.trim().to_string();
        if !id.is_empty() {
            return id;
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(&path, &id) {
        warn!(error = %err, path = %path.display(), "failed to persist generated federation node id");
    }
    id
}

fn load_persisted_nodes(data_dir: &Path, suffix: &str) -> Vec<PersistedNode> {
    let path = data_dir.join(format!("federation_nodes[{suffix}].json"));
    let Ok(contents) = std::fs::read_to_string(&path) else { return Vec::new() };
    serde_json::from_str(&contents).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FederationConfig {
        FederationConfig {
            enabled: true,
            seed_nodes: Vec::new(),
            secret: "shared".into(),
            node_url: "http://node-a.test".into(),
            node_id: Some("node-a".into()),
            health_interval_secs: 30,
            sync_interval_secs: 10,
            handshake_timeout_secs: 10,
            health_timeout_secs: 10,
            sync_timeout_secs: 8,
            proxy_timeout_secs: 30,
            event_timeout_secs: 7,
            offline_purge_days: 7,
        }
    }

    #[tokio::test]
    async fn handshake_registers_the_caller_and_replies_with_known_peers() {
        let tmp = tempfile::tempdir().unwrap();
        let fed = Federation::new(test_config(), tmp.path(), "node-a".into(), Arc::new(ServerMetrics::new()));

        let resp = fed
            .handle_handshake(HandshakeRequest {
                node_id: "node-b".into(),
                node_url: "http://node-b.test".into(),
                server_name: "node-b".into(),
                is_reverse: true,
            })
            .await
            .unwrap();

        assert_eq!(resp.node_id, "node-a");
        let peers = fed.peer_summaries().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "node-b");
    }

    #[tokio::test]
    async fn id_collision_with_a_different_url_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let fed = Federation::new(test_config(), tmp.path(), "node-a".into(), Arc::new(ServerMetrics::new()));
        fed.upsert_node("node-b".into(), "http://node-b.test".into(), "b".into()).await.unwrap();

        let err = fed.upsert_node("node-b".into(), "http://imposter.test".into(), "b".into()).await.unwrap_err();
        assert!(matches!(err, FederationError::IdCollision(_)));
    }

    #[tokio::test]
    async fn node_id_persists_across_instances_when_not_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.node_id = None;
        cfg.node_url = "http://node-x.test".into();

        let first = Federation::new(cfg.clone(), tmp.path(), "node-x".into(), Arc::new(ServerMetrics::new()));
        let second = Federation::new(cfg, tmp.path(), "node-x".into(), Arc::new(ServerMetrics::new()));
        assert_eq!(first.node_id(), second.node_id());
    }

    #[tokio::test]
    async fn handle_event_replaces_the_room_and_clears_it_on_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let fed = Federation::new(test_config(), tmp.path(), "node-a".into(), Arc::new(ServerMetrics::new()));

        fed.handle_event(RoomEvent {
            kind: RoomEventKind::Created,
            source_node_id: "node-b".into(),
            room_id: "r1".into(),
            data: Some(RoomSummary {
                id: "r1".into(),
                player_count: 1,
                max_players: 8,
                state: "select_chart".into(),
                locked: false,
                selected_chart: None,
            }),
            timestamp: 0,
        })
        .await;
        assert_eq!(fed.remote_room_catalog().await.len(), 1);

        fed.handle_event(RoomEvent {
            kind: RoomEventKind::Deleted,
            source_node_id: "node-b".into(),
            room_id: "r1".into(),
            data: None,
            timestamp: 1,
        })
        .await;
        assert_eq!(fed.remote_room_catalog().await.len(), 0);
    }
}
