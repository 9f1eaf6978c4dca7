//! Web-bridge visibility and third-party captcha configuration (§4.6, §6).

use super::defaults::{
    default_captcha_provider, default_enable_pri_web, default_enable_pub_web, default_pri_prefix,
    default_pub_prefix,
};
use serde::{Deserialize, Serialize};

/// Controls which rooms `GET /api/status` and the WebSocket catalog expose:
/// rooms whose id starts with `pub_prefix` are always listed when
/// `enable_pub_web`; rooms starting with `pri_prefix` are hidden from the
/// public catalog unless `enable_pri_web` is also set.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WebVisibilityConfig {
    pub enable_pub_web: bool,
    pub pub_prefix: String,
    pub enable_pri_web: bool,
    pub pri_prefix: String,
}

impl Default for WebVisibilityConfig {
    fn default() -> Self {
        Self {
            enable_pub_web: default_enable_pub_web(),
            pub_prefix: default_pub_prefix(),
            enable_pri_web: default_enable_pri_web(),
            pri_prefix: default_pri_prefix(),
        }
    }
}

impl WebVisibilityConfig {
    /// Whether a room id should appear in the spectator-facing catalog.
    #[must_use]
    pub fn is_room_visible(&self, room_id: &str) -> bool {
        if !self.pri_prefix.is_empty() && room_id.starts_with(self.pri_prefix.as_str()) {
            return self.enable_pri_web;
        }
        if !self.pub_prefix.is_empty() && !room_id.starts_with(self.pub_prefix.as_str()) {
            return false;
        }
        self.enable_pub_web
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaProvider {
    None,
    Geetest,
}

impl Default for CaptchaProvider {
    fn default() -> Self {
        Self::None
    }
}

impl std::str::FromStr for CaptchaProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geetest" => Ok(Self::Geetest),
            _ => Ok(Self::None),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CaptchaConfig {
    pub provider: CaptchaProvider,
    pub geetest_id: Option<String>,
    pub geetest_key: Option<String>,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            provider: default_captcha_provider().parse().unwrap_or_default(),
            geetest_id: None,
            geetest_key: None,
        }
    }
}

impl CaptchaConfig {
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.provider != CaptchaProvider::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_visibility_hides_private_prefix_unless_enabled() {
        let mut cfg = WebVisibilityConfig { pri_prefix: "_".into(), enable_pri_web: false, ..Default::default() };
        assert!(!cfg.is_room_visible("_secret"));
        cfg.enable_pri_web = true;
        assert!(cfg.is_room_visible("_secret"));
    }

    #[test]
    fn pub_prefix_restricts_visible_rooms() {
        let cfg = WebVisibilityConfig { pub_prefix: "pub-".into(), enable_pub_web: true, ..Default::default() };
        assert!(cfg.is_room_visible("pub-room"));
        assert!(!cfg.is_room_visible("other-room"));
    }
}
