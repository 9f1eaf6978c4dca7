//! Root configuration type.

use super::auth::AuthConfig;
use super::defaults::{
    default_data_dir, default_enable_web_server, default_host, default_port, default_server_name,
    default_tcp_enabled, default_web_port,
};
use super::federation::FederationConfig;
use super::logging::LoggingConfig;
use super::security::SecurityConfig;
use super::server::ServerConfig;
use super::web::{CaptchaConfig, WebVisibilityConfig};
use serde::{Deserialize, Serialize};

/// Root configuration for the session server. Field groups mirror the
/// §6 environment-variable table; see each submodule for the default for
/// every individual knob.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// TCP port the binary wire protocol listens on — `PORT`.
    pub port: u16,
    /// Bind address — `HOST`.
    pub host: String,
    /// Whether the TCP listener starts at all — `TCP_ENABLED`.
    pub tcp_enabled: bool,
    /// HTTP/WebSocket web bridge port — `WEB_PORT`.
    pub web_port: u16,
    /// Whether the web bridge starts at all — `ENABLE_WEB_SERVER`.
    pub enable_web_server: bool,
    /// Display name advertised in `/api/status` and federation handshakes —
    /// `SERVER_NAME`.
    pub server_name: String,
    /// Directory backing the ban lists and federation identity/peer files
    /// (§6 "Persisted files").
    pub data_dir: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub web: WebVisibilityConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            tcp_enabled: default_tcp_enabled(),
            web_port: default_web_port(),
            enable_web_server: default_enable_web_server(),
            server_name: default_server_name(),
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
            web: WebVisibilityConfig::default(),
            captcha: CaptchaConfig::default(),
            federation: FederationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// `default_avatar` lives on `AuthConfig` but is referenced frequently
    /// enough at the top level (welcome payloads, web bridge) to merit a
    /// forwarding accessor.
    #[must_use]
    pub fn default_avatar(&self) -> &str {
        if self.auth.default_avatar.is_empty() {
            return DEFAULT_AVATAR_FALLBACK;
        }
        &self.auth.default_avatar
    }
}

const DEFAULT_AVATAR_FALLBACK: &str = "default.png";
