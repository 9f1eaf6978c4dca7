//! Upstream identity/chart service configuration and auth-related timeouts.

use super::defaults::{
    default_auth_timeout_secs, default_chart_fetch_timeout_secs, default_default_avatar,
    default_phira_api_url, default_record_fetch_timeout_secs, default_token_length,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the identity/chart API (`PHIRA_API_URL`). `AuthClient`
    /// hits `{phira_api_url}/me`, `ChartService` hits `{phira_api_url}/chart/{id}`.
    pub phira_api_url: String,
    /// Required length of a client-supplied auth token (§9 resolved open
    /// question: default 20, overridable for deployments needing 32).
    pub token_length: usize,
    /// Avatar identifier handed to clients that never set one upstream.
    pub default_avatar: String,
    /// Timeout for the `AuthClient::authenticate` call.
    pub auth_timeout_secs: u64,
    /// Timeout for `ChartService::lookup` during `SelectChart`.
    pub chart_fetch_timeout_secs: u64,
    /// Timeout for the record fetch backing `Played`.
    pub record_fetch_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            phira_api_url: default_phira_api_url(),
            token_length: default_token_length(),
            default_avatar: default_default_avatar(),
            auth_timeout_secs: default_auth_timeout_secs(),
            chart_fetch_timeout_secs: default_chart_fetch_timeout_secs(),
            record_fetch_timeout_secs: default_record_fetch_timeout_secs(),
        }
    }
}
