//! Error types for peerdrop-core.

use thiserror::Error;

/// Errors raised while moving a file between peers.
///
/// Everything except [`TransferError::SessionClosed`] and
/// [`TransferError::Config`] is scoped to a single (file, peer) pair and is
/// recovered at that granularity.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Channel send/receive failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The channel to the peer closed mid-transfer.
    #[error("channel closed")]
    ChannelClosed,

    /// Reassembled content does not match the sender's digest.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// `end` arrived before every chunk did.
    #[error("missing chunks: received {received} of {expected}")]
    MissingChunks { received: u32, expected: u32 },

    /// The digest (ours or the sender's) did not become available in time.
    #[error("timed out waiting for digest")]
    DigestTimeout,

    /// Batch persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Malformed or unexpected message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// JSON payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The hashing worker failed or went away.
    #[error("integrity engine error: {message}")]
    Engine { message: String },

    /// Invalid configuration value.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// The session actor is gone.
    #[error("session closed")]
    SessionClosed,
}

impl TransferError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Returns true if the error only affects one transfer with one peer.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SessionClosed | Self::Config { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
