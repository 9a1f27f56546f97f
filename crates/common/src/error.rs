use thiserror::Error;

/// Common error types for onioncell
#[derive(Debug, Error)]
pub enum OnionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Circuit {0:#x} destroyed")]
    CircuitDestroyed(u32),

    #[error("Circuit truncated at hop {hop}: {reason}")]
    Truncated { hop: usize, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Router not found: {0}")]
    RouterNotFound(String),

    #[error("Invalid router: {0}")]
    InvalidRouter(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(u16),

    #[error("Circuit has no hops")]
    NoHops,

    #[error("Invalid cell: {0}")]
    InvalidCell(String),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for onioncell operations
pub type Result<T, E = OnionError> = std::result::Result<T, E>;

impl OnionError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
