use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TransferError};
use crate::transfer::constants::{
    DEFAULT_BATCH_TARGET_BYTES, DEFAULT_CHANNELS_PER_PEER, DEFAULT_CHUNK_SIZE,
    DEFAULT_DIGEST_TIMEOUT_SECS, DEFAULT_HASH_BLOCK_SIZE, DEFAULT_INLINE_HASH_THRESHOLD,
    DEFAULT_MEMORY_WINDOW_CHUNKS, DEFAULT_WINDOW_SIZE, MAX_FILE_SIZE, MAX_FRAME_SIZE,
};
use crate::protocol::CHUNK_HEADER_LEN;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "peerdrop";
const APP_NAME: &str = "peerdrop";
const CONFIG_FILE: &str = "config.json";

/// Environment variable pointing at an alternative config directory
pub const CONFIG_DIR_ENV: &str = "PEERDROP_CONFIG_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Wire chunk size in bytes
    pub chunk_size: usize,
    /// Maximum chunks in flight unacknowledged per recipient
    pub window_size: u32,
    /// Parallel data channels per recipient
    pub channels_per_peer: usize,
    /// Index of the channel carrying acks, hashes, `end` and confirmations
    pub control_channel: usize,
    /// Files up to this size are hashed before their metadata is sent
    pub inline_hash_threshold: u64,
    /// Internal regrouping size of the integrity engine
    pub hash_block_size: usize,
    /// Out-of-order chunks held in memory awaiting the hash frontier
    pub memory_window_chunks: usize,
    /// Target size of one persisted batch
    pub batch_target_bytes: usize,
    #[serde(with = "duration_secs")]
    pub digest_timeout: Duration,
    /// Largest file this node sends or accepts
    pub max_file_size: u64,
    /// Root of the overflow batch store
    pub storage_dir: PathBuf,
    /// Where delivered files are written by front-ends
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let storage_dir = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.data_local_dir().join("batches"))
            .unwrap_or_else(|| std::env::temp_dir().join("peerdrop_batches"));

        // Fixed download path: ~/peerdrop
        let download_dir = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerdrop");

        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            channels_per_peer: DEFAULT_CHANNELS_PER_PEER,
            control_channel: 0,
            inline_hash_threshold: DEFAULT_INLINE_HASH_THRESHOLD,
            hash_block_size: DEFAULT_HASH_BLOCK_SIZE,
            memory_window_chunks: DEFAULT_MEMORY_WINDOW_CHUNKS,
            batch_target_bytes: DEFAULT_BATCH_TARGET_BYTES,
            digest_timeout: Duration::from_secs(DEFAULT_DIGEST_TIMEOUT_SECS),
            max_file_size: MAX_FILE_SIZE,
            storage_dir,
            download_dir,
        }
    }
}

impl TransferConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load config from an explicit path, falling back to defaults
    pub fn load_from(path: &std::path::Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::get_config_path() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(TransferError::Config {
                message: message.to_string(),
            })
        };

        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_SIZE - CHUNK_HEADER_LEN {
            return fail("chunk_size must be at least 1 and fit in one frame");
        }
        if self.window_size == 0 {
            return fail("window_size must be at least 1");
        }
        if self.channels_per_peer == 0 || self.channels_per_peer > u8::MAX as usize {
            return fail("channels_per_peer must be between 1 and 255");
        }
        if self.control_channel >= self.channels_per_peer {
            return fail("control_channel must index an existing channel");
        }
        if self.hash_block_size == 0 {
            return fail("hash_block_size must be at least 1");
        }
        Ok(())
    }

    /// Number of chunks that make up one persisted batch
    pub fn chunks_per_batch(&self) -> u32 {
        (self.batch_target_bytes / self.chunk_size.max(1)).max(1) as u32
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
