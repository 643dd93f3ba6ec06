use serde_json::Value;

/// Failures a command or a session can run into.
///
/// Only `Transport` and `Backpressure` end a session; everything else is
/// reported back to the client in an acknowledgment.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TurboError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),
    #[error("path does not exist: {0}")]
    PathNotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("revision conflict: expected {expected}, current {current}")]
    Conflict {
        expected: u64,
        current: u64,
        value: Value,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("outbound queue full")]
    Backpressure,
}

impl TurboError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the owning session must be torn down.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Backpressure)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) | Self::UnsupportedCommand(_) => "protocol",
            Self::PathNotFound(_) => "path_not_found",
            Self::Storage(_) => "storage",
            Self::Conflict { .. } => "conflict",
            Self::Transport(_) => "transport",
            Self::Backpressure => "backpressure",
        }
    }
}
