//! Failure taxonomy of the engine.
//!
//! Transport failures are recovered by the connection manager; command and
//! fetch failures go back to the caller that issued them and nowhere else.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Push connection is down. Retried by the connection manager.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The server refused a mutating call; the command was rolled back.
    #[error("command rejected (status {status:?}): {message}")]
    CommandRejected { status: Option<u16>, message: String },

    /// A page load failed; the previous page stays on screen.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A superseded request resolved late and was discarded.
    #[error("stale response discarded")]
    StaleResponse,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::CommandRejected {
            status,
            message: message.into(),
        }
    }

    /// Whether the caller should show this error at all.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, SyncError::StaleResponse | SyncError::NetworkUnavailable)
    }
}
