//! Top-level error taxonomy (§7): each subsystem exposes a `thiserror` enum
//! at its public boundary; callers that only need to log-and-continue widen
//! it into `anyhow::Error` at the point they stop propagating it.

use thiserror::Error;

/// Errors surfaced to a connected client as the `Err` half of a
/// `Result<T, String>` server command, or used internally to decide whether
/// a connection should be torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("already authenticated on this connection")]
    DuplicateAuth,
    #[error("invalid token")]
    InvalidToken,
    #[error("authentication failed: {0}")]
    AuthUpstreamFailure(String),
    #[error("you are banned: {0}")]
    Banned(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Room(#[from] crate::room::RoomError),
    #[error("chart service error: {0}")]
    Upstream(String),
}

impl ProtocolError {
    /// The short, user-facing string placed in the wire `Result::Err` slot.
    #[must_use]
    pub fn wire_message(&self) -> String {
        match self {
            Self::DuplicateAuth => "已经登录".to_string(),
            Self::InvalidToken => "令牌无效".to_string(),
            Self::AuthUpstreamFailure(_) => "登录失败".to_string(),
            Self::Banned(reason) => format!("你被封禁了: {reason}"),
            Self::NotAuthenticated => "请先登录".to_string(),
            Self::Room(e) => e.to_string(),
            Self::Upstream(_) => "服务暂时不可用".to_string(),
        }
    }

    /// Whether this error should close the connection outright.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Banned(_))
    }
}

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("peer request timed out")]
    Timeout,
    #[error("shared secret mismatch")]
    SecretMismatch,
    #[error("node id collision with {0}")]
    IdCollision(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer responded with an error: {0}")]
    PeerError(String),
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked out, try again later")]
    LockedOut,
    #[error("captcha required")]
    CaptchaRequired,
    #[error("origin not allowed")]
    OriginRejected,
    #[error("admin secret token invalid or expired")]
    InvalidSecretToken,
}
