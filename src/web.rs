//! HTTP/WebSocket web bridge (§4.6): a read-only room/player projection over
//! `GET /api/status` and a WebSocket catalog feed, plus an admin control
//! surface bound to `ProtocolEngine`'s `admin_*` methods and `BanStore`.
//!
//! Router construction follows the teacher's `websocket::create_router`
//! idiom: permissive-with-a-warning CORS fallback, `TraceLayer` on top, one
//! `State<Arc<WebState>>` shared across every handler.

use crate::ban_store::InMemoryBanStore;
use crate::config::{is_production_mode, Config};
use crate::errors::ProtocolError;
use crate::federation::{
    Federation, HandshakeRequest, ProxyCallbackRequest, ProxyCommandRequest, ProxyJoinRequest,
    ProxyLeaveRequest, RoomEvent, RoomSummary,
};
use crate::metrics::ServerMetrics;
use crate::protocol_engine::ProtocolEngine;
use crate::room::{Room, RoomStore};
use crate::security::crypto;
use crate::session::SessionTable;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type HmacSha256 = Hmac<Sha256>;

const ADMIN_COOKIE_NAME: &str = "phi_admin_session";
const ADMIN_COOKIE_TTL_SECS: i64 = 12 * 3600;
/// At most one coalesced catalog push per connection in this window (§4.6).
const CATALOG_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Everything a web-bridge handler needs, shared behind one `Arc` the way
/// `EnhancedGameServer` is shared across the teacher's handlers.
pub struct WebState {
    config: Arc<Config>,
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomStore>,
    engine: Arc<ProtocolEngine>,
    ban_store: Arc<InMemoryBanStore>,
    federation: Option<Arc<Federation>>,
    metrics: Arc<ServerMetrics>,
    login_guard: LoginGuard,
    server_start: i64,
}

impl WebState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionTable>,
        rooms: Arc<RoomStore>,
        engine: Arc<ProtocolEngine>,
        ban_store: Arc<InMemoryBanStore>,
        federation: Option<Arc<Federation>>,
        metrics: Arc<ServerMetrics>,
    ) -> Arc<Self> {
        let login_guard = LoginGuard::load(&config.data_dir);
        Arc::new(Self {
            config,
            sessions,
            rooms,
            engine,
            ban_store,
            federation,
            metrics,
            login_guard,
            server_start: now_ms(),
        })
    }
}

/// Failed-login tracking persisted to `login_blacklist.json` (§6 "Persisted
/// files"), mirroring `InMemoryBanStore`'s load-once/rewrite-on-change shape.
struct LoginGuard {
    failures: RwLock<HashMap<String, u32>>,
    blacklist: RwLock<HashMap<String, i64>>,
    path: PathBuf,
}

impl LoginGuard {
    fn load(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join("login_blacklist.json");
        let blacklist = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self { failures: RwLock::new(HashMap::new()), blacklist: RwLock::new(blacklist), path }
    }

    async fn is_blocked(&self, ip: &str) -> bool {
        let now = now_ms();
        self.blacklist.read().await.get(ip).map(|&exp| exp > now).unwrap_or(false)
    }

    /// Records one failed attempt; blacklists the IP once `threshold` is hit.
    async fn record_failure(&self, ip: &str, threshold: u32, duration_secs: u64) {
        let hit_threshold = {
            let mut failures = self.failures.write().await;
            let count = failures.entry(ip.to_string()).or_insert(0);
            *count += 1;
            *count >= threshold
        };
        if hit_threshold {
            self.failures.write().await.remove(ip);
            self.blacklist.write().await.insert(ip.to_string(), now_ms() + duration_secs as i64 * 1000);
            self.persist().await;
        }
    }

    async fn record_success(&self, ip: &str) {
        self.failures.write().await.remove(ip);
    }

    async fn persist(&self) {
        let snapshot = self.blacklist.read().await.clone();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(err) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %err, path = %self.path.display(), "failed to persist login blacklist");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize login blacklist"),
        }
    }
}

/// Builds the router the way the teacher's `create_router` does: a CORS
/// layer that falls back to permissive (with a warning) on unparseable or
/// empty configuration, then a trace layer on top.
pub fn router(state: Arc<WebState>) -> Router {
    let cors = build_cors(&state.config.security.allowed_origins);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/api/admin/metrics", get(admin_metrics))
        .route("/api/admin/bans", get(admin_list_bans))
        .route("/api/admin/kick-player", post(admin_kick_player))
        .route("/api/admin/force-start", post(admin_force_start))
        .route("/api/admin/toggle-lock", post(admin_toggle_lock))
        .route("/api/admin/set-max-players", post(admin_set_max_players))
        .route("/api/admin/close-room", post(admin_close_room))
        .route("/api/admin/toggle-mode", post(admin_toggle_mode))
        .route("/api/admin/send-server-message", post(admin_send_server_message))
        .route("/api/admin/ban-id", post(admin_ban_id))
        .route("/api/admin/unban-id", post(admin_unban_id))
        .route("/api/admin/ban-ip", post(admin_ban_ip))
        .route("/api/admin/unban-ip", post(admin_unban_ip))
        .route("/api/federation/handshake", post(federation_handshake))
        .route("/api/federation/health", get(federation_health))
        .route("/api/federation/rooms", get(federation_rooms))
        .route("/api/federation/proxy/join", post(federation_proxy_join))
        .route("/api/federation/proxy/command", post(federation_proxy_command))
        .route("/api/federation/proxy/leave", post(federation_proxy_leave))
        .route("/api/federation/proxy/callback", post(federation_proxy_callback))
        .route("/api/federation/event", post(federation_event))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        return CorsLayer::permissive();
    }
    let origins: Vec<_> =
        allowed_origins.split(',').filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok()).collect();

    if origins.is_empty() {
        tracing::warn!("no valid CORS origins configured for the web bridge, using permissive CORS");
        return CorsLayer::permissive();
    }
    CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
}

// ---------------------------------------------------------------------
// Status + catalog
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "serverName")]
    server_name: String,
    #[serde(rename = "sessionCount")]
    session_count: usize,
    rooms: Vec<RoomSummary>,
    federation: Option<FederationStatusDto>,
}

#[derive(Debug, Serialize)]
struct FederationStatusDto {
    #[serde(rename = "nodeId")]
    node_id: String,
    #[serde(rename = "peerCount")]
    peer_count: usize,
    enabled: bool,
}

fn summarize_room(room: &Room) -> RoomSummary {
    RoomSummary {
        id: room.id.clone(),
        player_count: room.active_player_count() as u8,
        max_players: room.max_players,
        state: room.state.label().to_string(),
        locked: room.locked,
        selected_chart: room.selected_chart,
    }
}

/// Combines the local visible catalog with whatever remote catalog
/// federation has cached, both filtered through `WebVisibilityConfig`.
async fn visible_room_catalog(state: &WebState) -> Vec<RoomSummary> {
    let mut out = Vec::new();
    for id in state.rooms.list_ids().await {
        if !state.config.web.is_room_visible(&id) {
            continue;
        }
        if let Some(room) = state.rooms.get(&id).await {
            out.push(summarize_room(&room));
        }
    }
    if let Some(federation) = &state.federation {
        for summary in federation.remote_room_catalog().await {
            if state.config.web.is_room_visible(&summary.id) {
                out.push(summary);
            }
        }
    }
    out
}

async fn status_handler(State(state): State<Arc<WebState>>) -> Json<StatusResponse> {
    let rooms = visible_room_catalog(&state).await;
    let federation = match &state.federation {
        Some(fed) if fed.enabled() => {
            let health = fed.health_response().await;
            Some(FederationStatusDto { node_id: health.node_id, peer_count: health.peers.len(), enabled: true })
        }
        _ => None,
    };
    Json(StatusResponse {
        server_name: state.config.server_name.clone(),
        session_count: state.sessions.len().await,
        rooms,
        federation,
    })
}

#[derive(Debug, Serialize)]
struct WsEnvelope<T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: T,
}

#[derive(Debug, Deserialize, Default)]
struct ClientWsPayload {
    #[serde(rename = "roomId", default)]
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct ClientWsRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: ClientWsPayload,
}

async fn room_list_frame(state: &WebState) -> String {
    let rooms = visible_room_catalog(state).await;
    serde_json::to_string(&WsEnvelope { kind: "roomList", payload: rooms }).unwrap_or_default()
}

async fn server_stats_frame(state: &WebState) -> String {
    let stats = serde_json::json!({
        "sessionCount": state.sessions.len().await,
        "roomCount": state.rooms.len().await,
        "uptimeSecs": (now_ms() - state.server_start) / 1000,
    });
    serde_json::to_string(&WsEnvelope { kind: "serverStats", payload: stats }).unwrap_or_default()
}

async fn room_details_frame(state: &WebState, room_id: &str) -> Option<String> {
    if !state.config.web.is_room_visible(room_id) {
        return None;
    }
    let room = state.rooms.get(room_id).await?;
    let detail = serde_json::json!({
        "id": room.id,
        "ownerId": room.owner_id,
        "state": room.state.label(),
        "locked": room.locked,
        "cycle": room.cycle,
        "maxPlayers": room.max_players,
        "selectedChart": room.selected_chart,
        "players": room.players.values().map(|p| serde_json::json!({
            "userId": p.user.id,
            "name": p.user.name,
            "monitor": p.user.monitor,
            "isReady": p.is_ready,
            "isFinished": p.is_finished,
        })).collect::<Vec<_>>(),
    });
    Some(serde_json::to_string(&WsEnvelope { kind: "roomDetails", payload: detail }).unwrap_or_default())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<WebState>) {
    if socket.send(WsMessage::Text(room_list_frame(&state).await.into())).await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(CATALOG_BROADCAST_INTERVAL);
    ticker.tick().await; // first tick fires immediately; the snapshot above already covered it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if socket.send(WsMessage::Text(room_list_frame(&state).await.into())).await.is_err() {
                    break;
                }
                if socket.send(WsMessage::Text(server_stats_frame(&state).await.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(req) = serde_json::from_str::<ClientWsRequest>(&text) else { continue };
                        if req.kind == "getRoomDetails" {
                            if let Some(frame) = room_details_frame(&state, &req.payload.room_id).await {
                                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Admin session cookie (HMAC-SHA256 over the crate's own crypto primitives
// rather than a dedicated cookie crate — none is in the dependency stack)
// ---------------------------------------------------------------------

fn sign_admin_cookie(secret: &str, issued_at_ms: i64) -> String {
    let payload = format!("admin:{issued_at_ms}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    let sig = mac.finalize().into_bytes();
    format!("{}.{}", BASE64.encode(payload.as_bytes()), hex::encode(sig))
}

fn verify_admin_cookie(secret: &str, cookie_value: &str, now: i64) -> bool {
    let Some((payload_b64, sig_hex)) = cookie_value.split_once('.') else { return false };
    let Ok(payload_bytes) = BASE64.decode(payload_b64) else { return false };
    let Ok(expected_sig) = hex::decode(sig_hex) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(&payload_bytes);
    if mac.verify_slice(&expected_sig).is_err() {
        return false;
    }
    let Ok(payload) = std::str::from_utf8(&payload_bytes) else { return false };
    let Some(issued_at_str) = payload.strip_prefix("admin:") else { return false };
    let Ok(issued_at_ms) = issued_at_str.parse::<i64>() else { return false };
    issued_at_ms <= now && now - issued_at_ms < ADMIN_COOKIE_TTL_SECS * 1000
}

fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|kv| {
        let (key, value) = kv.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(subtle::ConstantTimeEq::ct_eq(a.as_bytes(), b.as_bytes()))
}

fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_proxy_hops: u8) -> String {
    if trust_proxy_hops > 0 {
        if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let hops: Vec<&str> = value.split(',').map(str::trim).collect();
            let idx = hops.len().saturating_sub(trust_proxy_hops as usize);
            if let Some(ip) = hops.get(idx) {
                return (*ip).to_string();
            }
        }
    }
    addr.ip().to_string()
}

/// Accepts either the signed session cookie or the date-anchored
/// `X-Admin-Secret` token (§4.6).
async fn authorize_admin(state: &WebState, headers: &HeaderMap) -> bool {
    if let Some(token) = headers.get("x-admin-secret").and_then(|v| v.to_str().ok()) {
        let key = crypto::derive_admin_secret_key(&state.config.security.admin_secret);
        if crypto::verify_admin_secret_token(&key, &state.config.security.admin_secret, token, chrono::Utc::now()) {
            return true;
        }
    }
    if let Some(cookie) = extract_cookie(headers, ADMIN_COOKIE_NAME) {
        if verify_admin_cookie(&state.config.security.session_secret, cookie, now_ms()) {
            return true;
        }
    }
    false
}

/// CSRF defense for state-changing admin endpoints: Origin/Referer must
/// match the configured allow-list. An empty allow-list means same-origin
/// only, which the browser already enforces without a header to check here.
fn csrf_allowed(state: &WebState, headers: &HeaderMap) -> bool {
    let allowlist = &state.config.security.admin_origin_allowlist;
    if allowlist.is_empty() {
        return true;
    }
    let origin = headers
        .get(header::ORIGIN)
        .or_else(|| headers.get(header::REFERER))
        .and_then(|v| v.to_str().ok());
    match origin {
        Some(value) => allowlist.iter().any(|allowed| value.starts_with(allowed.as_str())),
        None => false,
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false, "error": message}))).into_response()
}

async fn require_admin(state: &WebState, headers: &HeaderMap) -> Result<(), Response> {
    if !authorize_admin(state, headers).await {
        return Err(unauthorized("admin authorization required"));
    }
    if !csrf_allowed(state, headers) {
        return Err((StatusCode::FORBIDDEN, Json(serde_json::json!({"ok": false, "error": "origin not allowed"})))
            .into_response());
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Login / logout
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    #[serde(default)]
    captcha_token: String,
}

async fn login_handler(
    State(state): State<Arc<WebState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let ip = client_ip(&headers, addr, state.config.security.trust_proxy_hops);

    if state.login_guard.is_blocked(&ip).await {
        return Redirect::to("/login?error=locked").into_response();
    }
    if state.config.captcha.is_required() && form.captcha_token.trim().is_empty() {
        return Redirect::to("/login?error=captcha").into_response();
    }

    let admin_name = &state.config.security.admin_name;
    let admin_password = &state.config.security.admin_password;
    let credentials_ok = !admin_name.is_empty()
        && constant_time_str_eq(&form.username, admin_name)
        && constant_time_str_eq(&form.password, admin_password);

    if !credentials_ok {
        state
            .login_guard
            .record_failure(&ip, state.config.security.admin_lockout_threshold, state.config.security.login_blacklist_duration_secs)
            .await;
        return Redirect::to("/login?error=invalid").into_response();
    }

    state.login_guard.record_success(&ip).await;
    let cookie_value = sign_admin_cookie(&state.config.security.session_secret, now_ms());
    let secure_flag = if is_production_mode() { "; Secure" } else { "" };
    let set_cookie = format!("{ADMIN_COOKIE_NAME}={cookie_value}; Path=/; HttpOnly; SameSite=Lax{secure_flag}");

    let mut response = Redirect::to("/").into_response();
    if let Ok(value) = set_cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

async fn logout_handler() -> Response {
    let mut response = Redirect::to("/login").into_response();
    let clear_cookie = format!("{ADMIN_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if let Ok(value) = clear_cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

// ---------------------------------------------------------------------
// Admin mutation endpoints
// ---------------------------------------------------------------------

fn protocol_error_response(err: ProtocolError) -> Response {
    let status = match &err {
        ProtocolError::Room(crate::room::RoomError::NotFound) => StatusCode::NOT_FOUND,
        ProtocolError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(serde_json::json!({"ok": false, "error": err.wire_message()}))).into_response()
}

fn ok_response() -> Response {
    Json(serde_json::json!({"ok": true})).into_response()
}

#[derive(Debug, Deserialize)]
struct KickPlayerRequest {
    #[serde(rename = "userId")]
    user_id: i32,
}

async fn admin_kick_player(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<KickPlayerRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_kick_player(req.user_id).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct RoomIdRequest {
    #[serde(rename = "roomId")]
    room_id: String,
}

async fn admin_force_start(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<RoomIdRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_force_start(&req.room_id).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

async fn admin_close_room(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<RoomIdRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_close_room(&req.room_id).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleLockRequest {
    #[serde(rename = "roomId")]
    room_id: String,
    lock: bool,
}

async fn admin_toggle_lock(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<ToggleLockRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_toggle_lock(&req.room_id, req.lock).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleModeRequest {
    #[serde(rename = "roomId")]
    room_id: String,
    cycle: bool,
}

async fn admin_toggle_mode(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<ToggleModeRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_toggle_mode(&req.room_id, req.cycle).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SetMaxPlayersRequest {
    #[serde(rename = "roomId")]
    room_id: String,
    #[serde(rename = "maxPlayers")]
    max_players: u8,
}

async fn admin_set_max_players(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<SetMaxPlayersRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_set_max_players(&req.room_id, req.max_players).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct SendServerMessageRequest {
    #[serde(rename = "roomId")]
    room_id: String,
    content: String,
}

async fn admin_send_server_message(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<SendServerMessageRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    match state.engine.admin_send_server_message(&req.room_id, req.content).await {
        Ok(()) => ok_response(),
        Err(err) => protocol_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct BanIdRequest {
    #[serde(rename = "userId")]
    user_id: i32,
    reason: String,
    #[serde(rename = "expiresAt", default)]
    expires_at: Option<i64>,
    #[serde(rename = "adminName", default)]
    admin_name: Option<String>,
}

async fn admin_ban_id(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<BanIdRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    state.ban_store.ban_id(req.user_id, req.reason, req.expires_at, req.admin_name).await;
    ok_response()
}

#[derive(Debug, Deserialize)]
struct UnbanIdRequest {
    #[serde(rename = "userId")]
    user_id: i32,
}

async fn admin_unban_id(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<UnbanIdRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    state.ban_store.unban_id(req.user_id).await;
    ok_response()
}

#[derive(Debug, Deserialize)]
struct BanIpRequest {
    ip: String,
    reason: String,
    #[serde(rename = "expiresAt", default)]
    expires_at: Option<i64>,
    #[serde(rename = "adminName", default)]
    admin_name: Option<String>,
}

async fn admin_ban_ip(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<BanIpRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    state.ban_store.ban_ip(req.ip, req.reason, req.expires_at, req.admin_name).await;
    ok_response()
}

#[derive(Debug, Deserialize)]
struct UnbanIpRequest {
    ip: String,
}

async fn admin_unban_ip(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<UnbanIpRequest>) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    state.ban_store.unban_ip(&req.ip).await;
    ok_response()
}

async fn admin_list_bans(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    let id_bans = state.ban_store.list_id_bans().await;
    let ip_bans = state.ban_store.list_ip_bans().await;
    Json(serde_json::json!({"idBans": id_bans, "ipBans": ip_bans})).into_response()
}

async fn admin_metrics(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }
    Json(state.metrics.snapshot()).into_response()
}

// ---------------------------------------------------------------------
// Federation HTTP surface (§4.5, §6) — authorized by X-Federation-Secret
// ---------------------------------------------------------------------

fn federation_authorized(state: &WebState, headers: &HeaderMap) -> Option<&Arc<Federation>> {
    let fed = state.federation.as_ref()?;
    let provided = headers.get("x-federation-secret").and_then(|v| v.to_str().ok())?;
    fed.verify_secret(provided).then_some(fed)
}

fn federation_unavailable() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn federation_handshake(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<HandshakeRequest>,
) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    match fed.handle_handshake(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

async fn federation_health(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    Json(fed.health_response().await).into_response()
}

async fn federation_rooms(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    Json(fed.rooms_response(&state.rooms).await).into_response()
}

async fn federation_proxy_join(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<ProxyJoinRequest>,
) -> Response {
    if state.federation.is_none() {
        return federation_unavailable();
    }
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    Json(fed.handle_proxy_join(req).await).into_response()
}

async fn federation_proxy_command(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<ProxyCommandRequest>,
) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    match fed.handle_proxy_command(req).await {
        Ok(()) => ok_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"ok": false, "error": err}))).into_response(),
    }
}

async fn federation_proxy_leave(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<ProxyLeaveRequest>,
) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    fed.handle_proxy_leave(req).await;
    ok_response()
}

async fn federation_proxy_callback(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Json(req): Json<ProxyCallbackRequest>,
) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    fed.handle_proxy_callback(req).await;
    ok_response()
}

async fn federation_event(State(state): State<Arc<WebState>>, headers: HeaderMap, Json(req): Json<RoomEvent>) -> Response {
    let Some(fed) = federation_authorized(&state, &headers) else { return unauthorized("federation secret rejected") };
    fed.handle_event(req).await;
    ok_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_cookie_round_trips_and_rejects_tampering() {
        let cookie = sign_admin_cookie("s3cr3t", 1_000);
        assert!(verify_admin_cookie("s3cr3t", &cookie, 1_500));
        assert!(!verify_admin_cookie("wrong-secret", &cookie, 1_500));

        let mut tampered = cookie.clone();
        tampered.push('x');
        assert!(!verify_admin_cookie("s3cr3t", &tampered, 1_500));
    }

    #[test]
    fn admin_cookie_expires_after_ttl() {
        let cookie = sign_admin_cookie("s3cr3t", 0);
        let just_before = ADMIN_COOKIE_TTL_SECS * 1000 - 1;
        let just_after = ADMIN_COOKIE_TTL_SECS * 1000 + 1;
        assert!(verify_admin_cookie("s3cr3t", &cookie, just_before));
        assert!(!verify_admin_cookie("s3cr3t", &cookie, just_after));
    }

    #[test]
    fn cookie_extraction_finds_named_cookie_among_several() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "foo=bar; phi_admin_session=abc123; baz=qux".parse().unwrap());
        assert_eq!(extract_cookie(&headers, ADMIN_COOKIE_NAME), Some("abc123"));
    }

    #[test]
    fn client_ip_prefers_forwarded_header_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
        assert_eq!(client_ip(&headers, addr, 1), "10.0.0.1");
        assert_eq!(client_ip(&headers, addr, 0), "127.0.0.1");
    }

    #[tokio::test]
    async fn login_guard_blocks_after_threshold_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let guard = LoginGuard::load(tmp.path());
        assert!(!guard.is_blocked("1.2.3.4").await);
        for _ in 0..3 {
            guard.record_failure("1.2.3.4", 3, 60).await;
        }
        assert!(guard.is_blocked("1.2.3.4").await);
    }

    #[tokio::test]
    async fn login_guard_success_clears_failure_count() {
        let tmp = tempfile::tempdir().unwrap();
        let guard = LoginGuard::load(tmp.path());
        guard.record_failure("5.6.7.8", 5, 60).await;
        guard.record_success("5.6.7.8").await;
        assert!(!guard.is_blocked("5.6.7.8").await);
    }
}
