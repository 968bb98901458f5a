/// Default QUIC port for peer links
pub const TRANSFER_PORT: u16 = 9000;

/// Buffer size for whole-file hashing reads (1MB)
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Wire chunk size (16KB, fits a single data-channel message)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Chunks in flight unacknowledged per recipient
pub const DEFAULT_WINDOW_SIZE: u32 = 10;

pub const DEFAULT_CHANNELS_PER_PEER: usize = 4;

/// Files above this size get their hash in a separate, later message (8MB)
pub const DEFAULT_INLINE_HASH_THRESHOLD: u64 = 8 * 1024 * 1024;

pub const DEFAULT_HASH_BLOCK_SIZE: usize = 1024 * 1024;

pub const DEFAULT_MEMORY_WINDOW_CHUNKS: usize = 64;

pub const DEFAULT_BATCH_TARGET_BYTES: usize = 1024 * 1024;

pub const DEFAULT_DIGEST_TIMEOUT_SECS: u64 = 30;

/// Largest file sent or accepted by default (4GB); received files are held in memory whole
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum accepted file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Largest frame accepted from a stream-based link (64MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
