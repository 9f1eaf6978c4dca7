//! Configuration module for the session server.
//!
//! Supports layered loading — JSON file, inline/stdin JSON, flat
//! environment-variable overrides, and compiled-in defaults — see
//! [`loader::load`] for the precedence order.
//!
//! # Module structure
//!
//! - [`types`]: root [`Config`] struct
//! - [`server`]: room sizing, heartbeat and cleanup timing
//! - [`auth`]: upstream auth/chart-service endpoints and token format
//! - [`security`]: CORS, proxy trust, session/admin secrets, TLS
//! - [`web`]: public/private room visibility and captcha
//! - [`federation`]: cross-node federation settings
//! - [`logging`]: structured logging configuration
//! - [`loader`]: configuration loading functions
//! - [`validation`]: configuration validation functions
//! - [`defaults`]: default value functions

// Submodules
pub mod auth;
pub mod defaults;
pub mod federation;
pub mod loader;
pub mod logging;
pub mod security;
pub mod server;
pub mod types;
pub mod validation;
pub mod web;

// Re-exports for convenience
pub use auth::AuthConfig;

pub use federation::FederationConfig;

pub use loader::load;

pub use logging::{LogFormat, LogLevel, LoggingConfig};

pub use security::{SecurityConfig, TlsServerConfig, TransportSecurityConfig};

pub use server::ServerConfig;

pub use types::Config;

pub use validation::{is_production_mode, validate_config_security};

pub use web::{CaptchaConfig, CaptchaProvider, WebVisibilityConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();

        assert_eq!(config.port, 2022);
        assert_eq!(config.web_port, 8080);
        assert!(config.tcp_enabled);
        assert!(config.enable_web_server);
        assert_eq!(config.server.room_size, 8);
        assert_eq!(config.server.heartbeat_interval_secs, 30);
        assert_eq!(config.server.heartbeat_timeout_secs, 10);
        assert_eq!(config.server.room_cleanup_interval_secs, 60);
        assert_eq!(config.auth.token_length, 20);
        assert_eq!(config.logging.dir, "logs");
        assert_eq!(config.logging.filename, "server.log");
        assert_eq!(config.logging.rotation, "daily");
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config.port, deserialized.port);
        assert_eq!(config.server.room_size, deserialized.server.room_size);
        assert_eq!(config.auth.token_length, deserialized.auth.token_length);
        assert_eq!(config.federation.enabled, deserialized.federation.enabled);
    }

    #[test]
    fn log_level_as_str() {
        assert_eq!(LogLevel::Trace.as_str(), "trace");
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }

    #[test]
    fn captcha_required_iff_provider_set() {
        let none = CaptchaConfig::default();
        assert!(!none.is_required());
        let geetest = CaptchaConfig {
            provider: CaptchaProvider::Geetest,
            ..Default::default()
        };
        assert!(geetest.is_required());
    }
}
