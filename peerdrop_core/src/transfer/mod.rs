//! Chunked file-transfer protocol engine.
//!
//! This module provides:
//! - Acknowledgement-driven sliding window for outbound chunks
//! - Per-recipient push loop fanning chunks across parallel channels
//! - Out-of-order receive reassembly with ordered integrity hashing
//! - Multi-recipient outcome tracking

pub mod constants;
pub mod coordinator;
pub mod receiver;
pub mod sender;
pub mod utils;
pub mod window;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use coordinator::{OutboundTransfer, RecipientState, TransferPhase, TransferSummary};
pub use receiver::{ChunkOutcome, InboundTransfer, ReceiveState};
pub use sender::{
    ChunkSource, HashState, PushStats, RecipientPush, prepare_metadata, push_to_recipient,
    spawn_late_hash,
};
pub use window::SendWindow;
