//! Ban list lookups (§6.3): kept separate from `AuthClient` because bans are
//! server-local policy, not an upstream account fact.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

#[async_trait]
pub trait BanStore: Send + Sync {
    /// Returns the ban reason if this user id is currently banned.
    async fn ban_reason_for_id(&self, user_id: i32) -> Option<String>;

    /// Returns the ban reason if this client IP is currently banned.
    async fn ban_reason_for_ip(&self, ip: &str) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub target: String,
    pub reason: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<i64>,
    #[serde(rename = "adminName", default)]
    pub admin_name: Option<String>,
}

impl BanEntry {
    fn is_active(&self, now_ms: i64) -> bool {
        self.expires_at.map(|exp| exp > now_ms).unwrap_or(true)
    }
}

fn load_bans(path: &Path) -> HashMap<String, BanEntry> {
    let Ok(contents) = std::fs::read_to_string(path) else { return HashMap::new() };
    serde_json::from_str(&contents).unwrap_or_default()
}

fn persist_bans(path: &Path, entries: &HashMap<String, BanEntry>) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(entries) {
        Ok(json) => {
            if let Err(err) = std::fs::write(path, json) {
                warn!(error = %err, path = %path.display(), "failed to persist ban list");
            }
        }
        Err(err) => warn!(error = %err, "failed to serialize ban list"),
    }
}

/// In-memory ban tables, persisted to JSON on every mutation the way the
/// teacher's config layer persists its own state to disk rather than a
/// database (§10.3). Loaded once at startup; admin endpoints mutate it live.
pub struct InMemoryBanStore {
    id_bans: RwLock<HashMap<String, BanEntry>>,
    ip_bans: RwLock<HashMap<String, BanEntry>>,
    id_path: PathBuf,
    ip_path: PathBuf,
}

impl Default for InMemoryBanStore {
    fn default() -> Self {
        Self {
            id_bans: RwLock::new(HashMap::new()),
            ip_bans: RwLock::new(HashMap::new()),
            id_path: PathBuf::new(),
            ip_path: PathBuf::new(),
        }
    }
}

impl InMemoryBanStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `banidList.json`/`banipList.json` from `data_dir`, creating
    /// empty tables when absent.
    #[must_use]
    pub fn load(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        let id_path = data_dir.join("banidList.json");
        let ip_path = data_dir.join("banipList.json");
        Self {
            id_bans: RwLock::new(load_bans(&id_path)),
            ip_bans: RwLock::new(load_bans(&ip_path)),
            id_path,
            ip_path,
        }
    }

    pub async fn ban_id(&self, user_id: i32, reason: String, expires_at: Option<i64>, admin_name: Option<String>) {
        let target = user_id.to_string();
        let entry = BanEntry { target: target.clone(), reason, created_at: Utc::now().timestamp_millis(), expires_at, admin_name };
        let mut bans = self.id_bans.write().await;
        bans.insert(target, entry);
        persist_bans(&self.id_path, &bans);
    }

    pub async fn unban_id(&self, user_id: i32) {
        let mut bans = self.id_bans.write().await;
        bans.remove(&user_id.to_string());
        persist_bans(&self.id_path, &bans);
    }

    pub async fn ban_ip(&self, ip: String, reason: String, expires_at: Option<i64>, admin_name: Option<String>) {
        let entry = BanEntry { target: ip.clone(), reason, created_at: Utc::now().timestamp_millis(), expires_at, admin_name };
        let mut bans = self.ip_bans.write().await;
        bans.insert(ip, entry);
        persist_bans(&self.ip_path, &bans);
    }

    pub async fn unban_ip(&self, ip: &str) {
        let mut bans = self.ip_bans.write().await;
        bans.remove(ip);
        persist_bans(&self.ip_path, &bans);
    }

    pub async fn list_id_bans(&self) -> Vec<BanEntry> {
        self.id_bans.read().await.values().cloned().collect()
    }

    pub async fn list_ip_bans(&self) -> Vec<BanEntry> {
        self.ip_bans.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl BanStore for InMemoryBanStore {
    async fn ban_reason_for_id(&self, user_id: i32) -> Option<String> {
        let now = Utc::now().timestamp_millis();
        self.id_bans
            .read()
            .await
            .get(&user_id.to_string())
            .filter(|e| e.is_active(now))
            .map(|e| e.reason.clone())
    }

    async fn ban_reason_for_ip(&self, ip: &str) -> Option<String> {
        let now = Utc::now().timestamp_millis();
        self.ip_bans.read().await.get(ip).filter(|e| e.is_active(now)).map(|e| e.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ban_and_unban_round_trip() {
        let store = InMemoryBanStore::new();
        assert!(store.ban_reason_for_id(1).await.is_none());
        store.ban_id(1, "cheating".into(), None, None).await;
        assert_eq!(store.ban_reason_for_id(1).await.as_deref(), Some("cheating"));
        store.unban_id(1).await;
        assert!(store.ban_reason_for_id(1).await.is_none());
    }

    #[tokio::test]
    async fn expired_ban_is_not_active() {
        let store = InMemoryBanStore::new();
        let past = Utc::now().timestamp_millis() - 1_000;
        store.ban_id(2, "temp".into(), Some(past), None).await;
        assert!(store.ban_reason_for_id(2).await.is_none());
    }

    #[tokio::test]
    async fn ip_bans_are_tracked_independently_of_id_bans() {
        let store = InMemoryBanStore::new();
        store.ban_ip("1.2.3.4".into(), "abuse".into(), None, Some("root".into())).await;
        assert_eq!(store.ban_reason_for_ip("1.2.3.4").await.as_deref(), Some("abuse"));
        assert!(store.ban_reason_for_id(99).await.is_none());
    }

    #[tokio::test]
    async fn load_from_disk_round_trips_persisted_entries() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = InMemoryBanStore::load(tmp.path());
            store.ban_id(7, "reason".into(), None, None).await;
        }
        let reloaded = InMemoryBanStore::load(tmp.path());
        assert_eq!(reloaded.ban_reason_for_id(7).await.as_deref(), Some("reason"));
    }
}
