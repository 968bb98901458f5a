use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod integrity;
pub mod link;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use session::{SessionHandle, spawn_session};

/// Opaque identifier of a remote peer, as reported by the peer-link layer
pub type PeerId = String;

/// Opaque unique token identifying one logical file transfer
pub type FileId = String;

/// Generate a fresh file id (UUID v4)
pub fn new_file_id() -> FileId {
    uuid::Uuid::new_v4().to_string()
}

/// File metadata announced before any chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    /// Chunk size the sender split the file with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
    /// BLAKE3 hex digest. Omitted for large files, sent later as a `hash` message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl FileMetadata {
    /// Number of chunks a file of `size` bytes splits into; `None` when the
    /// count does not fit the 32-bit chunk index
    pub fn chunk_count(size: u64, chunk_size: usize) -> Option<u32> {
        if chunk_size == 0 {
            return None;
        }
        u32::try_from(size.div_ceil(chunk_size as u64)).ok()
    }

    /// Byte length of chunk `index` (the last chunk may be shorter)
    pub fn chunk_len(&self, index: u32, chunk_size: usize) -> usize {
        let offset = index as u64 * chunk_size as u64;
        (chunk_size as u64).min(self.size.saturating_sub(offset)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Report from the session to its caller
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Status(String),

    Progress {
        file_id: FileId,
        percent: u8,
        direction: Direction,
    },

    /// A file was reassembled and validated
    FileReceived {
        file_id: FileId,
        name: String,
        data: Bytes,
        sender: PeerId,
    },

    /// An outbound transfer resolved for every initial recipient
    TransferOutcome {
        file_id: FileId,
        summary: transfer::TransferSummary,
    },

    /// The last pending outbound transfer resolved
    SendQueueDrained,

    Error(String),
}
