//! Security configuration: CORS, proxy trust, session/admin secrets, and the
//! optional TLS termination for the web bridge.

use super::defaults::{
    default_admin_lockout_threshold, default_admin_name, default_admin_password,
    default_admin_secret, default_allowed_origins, default_login_blacklist_duration_secs,
    default_session_secret, default_trust_proxy_hops,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Allowed CORS origins (comma-separated, or "*" for any) — `ALLOWED_ORIGINS`.
    pub allowed_origins: String,
    /// Number of trusted reverse-proxy hops. When non-zero, the transport's
    /// WebSocket upgrade path trusts `X-Forwarded-For`/`X-Real-IP` instead of
    /// the raw socket peer — `TRUST_PROXY_HOPS`.
    pub trust_proxy_hops: u8,
    /// Secret used to sign the admin session cookie — `SESSION_SECRET`.
    pub session_secret: String,
    /// How long a failed-login IP stays blacklisted — `LOGIN_BLACKLIST_DURATION`.
    pub login_blacklist_duration_secs: u64,
    /// Failed admin login attempts from one IP before lockout (§4.6).
    pub admin_lockout_threshold: u32,
    /// Admin panel username — `ADMIN_NAME`.
    pub admin_name: String,
    /// Admin panel password — `ADMIN_PASSWORD`. Compared in constant time.
    pub admin_password: String,
    /// Secret folded into the AES-256-CBC day-token — `ADMIN_SECRET`.
    pub admin_secret: String,
    /// Allow-list of Origin/Referer values accepted on state-changing admin
    /// endpoints (CSRF defense, §4.6). Empty means same-origin only.
    #[serde(default)]
    pub admin_origin_allowlist: Vec<String>,
    #[serde(default)]
    pub transport: TransportSecurityConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            trust_proxy_hops: default_trust_proxy_hops(),
            session_secret: default_session_secret(),
            login_blacklist_duration_secs: default_login_blacklist_duration_secs(),
            admin_lockout_threshold: default_admin_lockout_threshold(),
            admin_name: default_admin_name(),
            admin_password: default_admin_password(),
            admin_secret: default_admin_secret(),
            admin_origin_allowlist: Vec::new(),
            transport: TransportSecurityConfig::default(),
        }
    }
}

/// Transport-level security configuration (TLS termination for the web
/// bridge). Only meaningful when the crate's `tls` feature is enabled.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct TransportSecurityConfig {
    pub tls: TlsServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct TlsServerConfig {
    /// Enable HTTPS/TLS termination for the HTTP + WebSocket listener.
    pub enabled: bool,
    /// Path to the PEM-encoded certificate chain presented to clients.
    pub certificate_path: Option<String>,
    /// Path to the PEM-encoded private key corresponding to the certificate chain.
    pub private_key_path: Option<String>,
}
