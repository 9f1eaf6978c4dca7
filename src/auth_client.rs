//! Upstream authentication: exchanging a client-supplied token for the
//! `UserInfo` it belongs to (§6.1).

use crate::room::UserInfo;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, String>;
}

#[derive(Deserialize)]
struct PhiraProfileResponse {
    id: i32,
    name: String,
}

/// Talks to the chart/account service's profile endpoint over HTTP, the way
/// the reference client authenticates: the token is sent as a bearer
/// credential and the response carries the canonical user id and name.
pub struct HttpAuthClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthClient {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl AuthClient for HttpAuthClient {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, String> {
        let url = format!("{}/me", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("upstream returned {}", resp.status()));
        }
        let profile: PhiraProfileResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(UserInfo {
            id: profile.id,
            name: profile.name,
            monitor: false,
        })
    }
}

/// Fixed-table auth client for tests: maps token strings directly onto a
/// canned `UserInfo`, bypassing HTTP entirely.
#[derive(Default)]
pub struct StaticAuthClient {
    users_by_token: Mutex<HashMap<String, UserInfo>>,
}

impl StaticAuthClient {
    /// Every token of the configured length authenticates as the same user;
    /// convenient for tests that don't care about per-user tokens.
    #[must_use]
    pub fn single(id: i32, name: &str) -> Self {
        let this = Self::default();
        this.insert_wildcard(UserInfo { id, name: name.to_string(), monitor: false });
        this
    }

    fn insert_wildcard(&self, user: UserInfo) {
        self.users_by_token.lock().unwrap().insert("*".to_string(), user);
    }

    pub fn insert(&self, token: &str, user: UserInfo) {
        self.users_by_token.lock().unwrap().insert(token.to_string(), user);
    }
}

#[async_trait]
impl AuthClient for StaticAuthClient {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, String> {
        let table = self.users_by_token.lock().unwrap();
        if let Some(user) = table.get(token) {
            return Ok(user.clone());
        }
        if let Some(user) = table.get("*") {
            return Ok(user.clone());
        }
        Err("unknown token".to_string())
    }
}
