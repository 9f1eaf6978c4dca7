//! Default value functions for configuration fields.
//!
//! Organized by the same section breakdown as the rest of `config/`, so a
//! field's default is easy to find next to the struct that uses it.

use super::logging::LogFormat;

// =============================================================================
// Root / transport
// =============================================================================

pub const fn default_port() -> u16 {
    2022
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub const fn default_tcp_enabled() -> bool {
    true
}

pub const fn default_web_port() -> u16 {
    8080
}

pub const fn default_enable_web_server() -> bool {
    true
}

pub fn default_server_name() -> String {
    "Phira Server".to_string()
}

pub fn default_default_avatar() -> String {
    "default.png".to_string()
}

pub fn default_phira_api_url() -> String {
    "https://api.phira.cn".to_string()
}

// =============================================================================
// Room / heartbeat
// =============================================================================

pub const fn default_room_size() -> u8 {
    8
}

pub const fn default_heartbeat_interval_secs() -> u64 {
    30
}

pub const fn default_heartbeat_timeout_secs() -> u64 {
    10
}

pub const fn default_room_cleanup_interval_secs() -> u64 {
    60
}

pub const fn default_inactive_room_timeout_secs() -> u64 {
    3600
}

pub const fn default_history_capacity() -> usize {
    200
}

// =============================================================================
// Auth
// =============================================================================

pub const fn default_token_length() -> usize {
    20
}

pub const fn default_auth_timeout_secs() -> u64 {
    10
}

pub const fn default_chart_fetch_timeout_secs() -> u64 {
    20
}

pub const fn default_record_fetch_timeout_secs() -> u64 {
    20
}

// =============================================================================
// Security
// =============================================================================

pub fn default_allowed_origins() -> String {
    "*".to_string()
}

pub const fn default_trust_proxy_hops() -> u8 {
    0
}

pub fn default_session_secret() -> String {
    String::new()
}

pub const fn default_login_blacklist_duration_secs() -> u64 {
    900
}

pub const fn default_admin_lockout_threshold() -> u32 {
    8
}

pub fn default_admin_name() -> String {
    String::new()
}

pub fn default_admin_password() -> String {
    String::new()
}

pub fn default_admin_secret() -> String {
    String::new()
}

// =============================================================================
// Public/private web visibility
// =============================================================================

pub const fn default_enable_pub_web() -> bool {
    true
}

pub fn default_pub_prefix() -> String {
    String::new()
}

pub const fn default_enable_pri_web() -> bool {
    false
}

pub fn default_pri_prefix() -> String {
    "_".to_string()
}

// =============================================================================
// Captcha
// =============================================================================

pub fn default_captcha_provider() -> String {
    "none".to_string()
}

// =============================================================================
// Federation
// =============================================================================

pub const fn default_federation_enabled() -> bool {
    false
}

pub const fn default_federation_health_interval_secs() -> u64 {
    60
}

pub const fn default_federation_sync_interval_secs() -> u64 {
    120
}

pub const fn default_federation_handshake_timeout_secs() -> u64 {
    10
}

pub const fn default_federation_health_timeout_secs() -> u64 {
    10
}

pub const fn default_federation_sync_timeout_secs() -> u64 {
    8
}

pub const fn default_federation_proxy_timeout_secs() -> u64 {
    30
}

pub const fn default_federation_event_timeout_secs() -> u64 {
    7
}

pub const fn default_federation_offline_purge_days() -> u64 {
    7
}

// =============================================================================
// Logging
// =============================================================================

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_log_filename() -> String {
    "server.log".to_string()
}

pub fn default_rotation() -> String {
    "daily".to_string()
}

pub const fn default_enable_file_logging() -> bool {
    true
}

pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

// =============================================================================
// Data directory (ban lists, federation identity/peer persistence)
// =============================================================================

pub fn default_data_dir() -> String {
    "./data".to_string()
}
