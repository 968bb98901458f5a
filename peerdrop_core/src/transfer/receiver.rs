use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::utils::{progress_percent, validate_transfer_info};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::integrity::{HashSession, IntegrityEngine};
use crate::protocol::ChunkAckPayload;
use crate::store::{BatchWriter, ChunkStore, TransferKey};
use crate::FileMetadata;

/// Lifecycle of one inbound file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Receiving,
    /// `end` seen, reconstruction and verification under way
    Finalizing,
    Delivered,
    Failed,
}

/// What happened to one binary chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; the caller acks it
    Accepted,
    /// Already held; dropped without a second ack
    Duplicate,
    Rejected(String),
}

/// Received-chunk set, one bit per index
#[derive(Debug, Clone)]
struct ChunkBitmap {
    total_chunks: u32,
    bits: Vec<u64>,
}

impl ChunkBitmap {
    fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            bits: vec![0u64; (total_chunks as usize).div_ceil(64)],
        }
    }

    /// Returns false if the bit was already set
    fn set(&mut self, index: u32) -> bool {
        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    fn is_set(&self, index: u32) -> bool {
        index < self.total_chunks && (self.bits[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_chunks).filter(|i| !self.is_set(*i))
    }
}

/// Reassembly state for one file from one peer.
///
/// Chunks are persisted through a [`BatchWriter`] as they arrive. In-order
/// chunks are also fed to a streaming digest; chunks that arrive ahead of the
/// next expected index wait in a bounded memory window. When that window
/// overflows its oldest entries are evicted; they stay in the store, and once
/// the digest frontier reaches an evicted chunk the rest of the file is hashed
/// from the persisted batches at reconstruction time.
pub struct InboundTransfer {
    key: TransferKey,
    metadata: FileMetadata,
    chunk_size: usize,
    state: ReceiveState,
    received: ChunkBitmap,
    received_count: u32,
    next_expected: u32,
    memory_window: BTreeMap<u32, Bytes>,
    /// Window indices in arrival order; may hold indices already drained
    window_order: VecDeque<u32>,
    memory_limit: usize,
    digest_deferred: bool,
    writer: BatchWriter,
    hasher: HashSession,
    expected_hash: Arc<watch::Sender<Option<String>>>,
}

impl InboundTransfer {
    pub fn new(
        key: TransferKey,
        metadata: FileMetadata,
        config: &TransferConfig,
        store: &ChunkStore,
        engine: IntegrityEngine,
    ) -> Result<Self> {
        let chunk_size = metadata
            .chunk_size
            .map(|c| c as usize)
            .unwrap_or(config.chunk_size);
        if chunk_size == 0 {
            return Err(TransferError::protocol("metadata announces zero chunk size"));
        }
        // Reconstruction allocates `size` bytes up front
        validate_transfer_info(&metadata.name, metadata.size, config.max_file_size)?;
        let expected_chunks = FileMetadata::chunk_count(metadata.size, chunk_size)
            .ok_or_else(|| {
                TransferError::protocol(format!(
                    "{} bytes at {} per chunk overflows the chunk index",
                    metadata.size, chunk_size
                ))
            })?;
        if metadata.total_chunks != expected_chunks {
            return Err(TransferError::protocol(format!(
                "{} bytes at {} per chunk is {} chunks, metadata says {}",
                metadata.size, chunk_size, expected_chunks, metadata.total_chunks
            )));
        }

        let (expected_hash, _) = watch::channel(metadata.hash.clone());
        Ok(Self {
            writer: store.writer(key.clone(), metadata.total_chunks),
            received: ChunkBitmap::new(metadata.total_chunks),
            hasher: engine.start()?,
            key,
            chunk_size,
            state: ReceiveState::Receiving,
            received_count: 0,
            next_expected: 0,
            memory_window: BTreeMap::new(),
            window_order: VecDeque::new(),
            memory_limit: config.memory_window_chunks.max(1),
            digest_deferred: false,
            expected_hash: Arc::new(expected_hash),
            metadata,
        })
    }

    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.metadata.total_chunks
    }

    /// True once streaming stopped at an evicted chunk. Finalization then
    /// hashes everything past `bytes_fed` from the store, so the digest is
    /// the same either way; only the work moves to the end.
    pub fn digest_deferred(&self) -> bool {
        self.digest_deferred
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.received_count as u64, self.metadata.total_chunks as u64)
    }

    pub fn ack_for(&self, chunk_index: u32) -> ChunkAckPayload {
        ChunkAckPayload {
            file_id: self.metadata.file_id.clone(),
            chunk_index,
            total_chunks: self.metadata.total_chunks,
        }
    }

    /// Record the sender's late digest
    pub fn set_expected_hash(&self, hash: String) {
        self.expected_hash.send_replace(Some(hash));
    }

    /// Handle that can still deliver the digest once finalization started
    pub fn expected_hash_handle(&self) -> Arc<watch::Sender<Option<String>>> {
        self.expected_hash.clone()
    }

    /// Stop accepting chunks; `end` was received
    pub fn mark_ending(&mut self) {
        self.state = ReceiveState::Finalizing;
    }

    pub async fn accept_chunk(&mut self, index: u32, payload: Bytes) -> Result<ChunkOutcome> {
        if self.state != ReceiveState::Receiving {
            return Ok(ChunkOutcome::Rejected(format!(
                "chunk {index} after end of {}",
                self.metadata.file_id
            )));
        }
        if index >= self.metadata.total_chunks {
            return Ok(ChunkOutcome::Rejected(format!(
                "chunk {} out of range (total {})",
                index, self.metadata.total_chunks
            )));
        }
        let expected_len = self.metadata.chunk_len(index, self.chunk_size);
        if payload.len() != expected_len {
            return Ok(ChunkOutcome::Rejected(format!(
                "chunk {} is {} bytes, expected {}",
                index,
                payload.len(),
                expected_len
            )));
        }
        if self.received.is_set(index) {
            return Ok(ChunkOutcome::Duplicate);
        }

        self.writer.append_chunk(index, payload.clone()).await?;
        self.received.set(index);
        self.received_count += 1;

        if !self.digest_deferred {
            self.feed_in_order(index, payload)?;
        }
        Ok(ChunkOutcome::Accepted)
    }

    fn feed_in_order(&mut self, index: u32, payload: Bytes) -> Result<()> {
        if index != self.next_expected {
            self.memory_window.insert(index, payload);
            self.window_order.push_back(index);
            while self.memory_window.len() > self.memory_limit {
                let Some(oldest) = self.window_order.pop_front() else {
                    break;
                };
                if self.memory_window.remove(&oldest).is_some() {
                    debug!(
                        "Evicted chunk {} of {} from the memory window",
                        oldest, self.metadata.file_id
                    );
                }
            }
            return Ok(());
        }

        self.hasher.update(&payload)?;
        self.next_expected += 1;
        while let Some(next) = self.memory_window.remove(&self.next_expected) {
            self.hasher.update(&next)?;
            self.next_expected += 1;
        }
        if self.memory_window.is_empty() {
            self.window_order.clear();
        }

        // Received but no longer in the window: it was evicted
        if self.received.is_set(self.next_expected) {
            debug!(
                "Digest of {} stopped at evicted chunk {}, deferring the rest",
                self.metadata.file_id, self.next_expected
            );
            self.memory_window.clear();
            self.window_order.clear();
            self.digest_deferred = true;
        }
        Ok(())
    }

    /// Reconstruct the file from the chunk store and verify its digest.
    ///
    /// Waiting for the digest and for a late expected hash share one timeout.
    pub async fn finalize(self, store: &ChunkStore, timeout: Duration) -> Result<Bytes> {
        let InboundTransfer {
            key,
            metadata,
            received,
            received_count,
            writer,
            mut hasher,
            expected_hash,
            ..
        } = self;

        if received_count != metadata.total_chunks {
            let first_missing = received.missing().next().unwrap_or_default();
            warn!(
                "{} ended with {}/{} chunks, first missing {}",
                metadata.file_id, received_count, metadata.total_chunks, first_missing
            );
            return Err(TransferError::MissingChunks {
                received: received_count,
                expected: metadata.total_chunks,
            });
        }

        let hashed_until = hasher.bytes_fed();
        let mut buffer = BytesMut::with_capacity(metadata.size as usize);
        let mut next_batch = 0u32;
        store
            .read_all(&key, |batch_index, data| {
                if batch_index != next_batch {
                    return Err(TransferError::MissingChunks {
                        received: next_batch,
                        expected: writer.batch_count(),
                    });
                }
                next_batch += 1;

                let start = buffer.len() as u64;
                let end = start + data.len() as u64;
                if end > hashed_until {
                    let skip = hashed_until.saturating_sub(start) as usize;
                    hasher.update(&data[skip..])?;
                }
                buffer.extend_from_slice(&data);
                Ok(())
            })
            .await?;

        if next_batch != writer.batch_count() || buffer.len() as u64 != metadata.size {
            return Err(TransferError::MissingChunks {
                received: next_batch,
                expected: writer.batch_count(),
            });
        }

        debug!(
            "Digest of {} requested with {} updates queued",
            metadata.file_id,
            hasher.backlog()?
        );
        let pending = hasher.finalize()?;
        let mut expected_rx = expected_hash.subscribe();
        let (actual, expected) = tokio::time::timeout(timeout, async move {
            let actual = pending.wait().await?;
            let expected = expected_rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| TransferError::engine("expected hash source dropped"))?
                .clone()
                .unwrap_or_default();
            Ok::<_, TransferError>((actual, expected))
        })
        .await
        .map_err(|_| TransferError::DigestTimeout)??;

        if actual != expected {
            return Err(TransferError::Integrity { expected, actual });
        }
        debug!("{} verified ({} bytes)", metadata.file_id, metadata.size);
        Ok(buffer.freeze())
    }
}
