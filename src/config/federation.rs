//! Cross-node federation configuration (§4.5, §6).

use super::defaults::{
    default_federation_enabled, default_federation_event_timeout_secs,
    default_federation_handshake_timeout_secs, default_federation_health_interval_secs,
    default_federation_health_timeout_secs, default_federation_offline_purge_days,
    default_federation_proxy_timeout_secs, default_federation_sync_interval_secs,
    default_federation_sync_timeout_secs,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FederationConfig {
    pub enabled: bool,
    /// Node URLs to handshake with at startup — `FEDERATION_SEED_NODES`
    /// (comma-separated).
    pub seed_nodes: Vec<String>,
    /// Shared secret sent as `X-Federation-Secret` on every federation call.
    pub secret: String,
    /// This node's own externally-reachable base URL, sent during handshake.
    pub node_url: String,
    /// Explicit node id override; when unset, an id is generated once and
    /// persisted to `federation_id[<urlsuffix>].txt` under the data dir.
    pub node_id: Option<String>,
    pub health_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub handshake_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub proxy_timeout_secs: u64,
    pub event_timeout_secs: u64,
    /// Days a node may stay offline before the health loop purges it
    /// entirely from the peer table.
    pub offline_purge_days: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: default_federation_enabled(),
            seed_nodes: Vec::new(),
            secret: String::new(),
            node_url: String::new(),
            node_id: None,
            health_interval_secs: default_federation_health_interval_secs(),
            sync_interval_secs: default_federation_sync_interval_secs(),
            handshake_timeout_secs: default_federation_handshake_timeout_secs(),
            health_timeout_secs: default_federation_health_timeout_secs(),
            sync_timeout_secs: default_federation_sync_timeout_secs(),
            proxy_timeout_secs: default_federation_proxy_timeout_secs(),
            event_timeout_secs: default_federation_event_timeout_secs(),
            offline_purge_days: default_federation_offline_purge_days(),
        }
    }
}
