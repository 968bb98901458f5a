//! Overflow chunk store.
//!
//! Chunks are grouped into fixed-size batches (a partition of the chunk index
//! space) and each complete batch is written as one record. Record keys sort
//! lexicographically in batch order, so a prefix scan reads a transfer back in
//! file order.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::{FileId, PeerId};

const BATCH_EXTENSION: &str = "batch";

/// Identifies the persisted state of one inbound file from one peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub peer_id: PeerId,
    pub file_id: FileId,
}

impl TransferKey {
    pub fn new(peer_id: impl Into<PeerId>, file_id: impl Into<FileId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            file_id: file_id.into(),
        }
    }

    /// Key prefix shared by every batch of this transfer
    pub fn prefix(&self) -> String {
        format!("{}/{}/", key_segment(&self.peer_id), key_segment(&self.file_id))
    }

    pub fn batch_key(&self, batch_index: u32) -> String {
        format!("{}{:010}", self.prefix(), batch_index)
    }
}

/// Keep keys filesystem-safe (peer ids may be socket addresses)
fn key_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn batch_index_of(key: &str) -> Option<u32> {
    key.rsplit('/').next()?.parse().ok()
}

/// Persistent key/value backend for batches
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Keys starting with `prefix`, in lexicographic order
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Batches as files under a root directory, one directory per transfer
pub struct FsBatchStore {
    root: PathBuf,
}

impl FsBatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{BATCH_EXTENSION}"))
    }
}

#[async_trait]
impl BatchStore for FsBatchStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a scan never sees a torn record
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(self.path_for(key)).await?))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.root.join(prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(format!("{prefix}{stem}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.root.join(prefix)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory backend, mostly for tests and short-lived sessions
#[derive(Default)]
pub struct MemoryBatchStore {
    records: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (storage-error simulation)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("simulated write failure").into());
        }
        self.records.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, key.to_string()).into())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.records
            .write()
            .await
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

/// Batch-oriented facade over a [`BatchStore`]
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn BatchStore>,
    chunks_per_batch: u32,
}

impl ChunkStore {
    pub fn new(backend: Arc<dyn BatchStore>, chunks_per_batch: u32) -> Self {
        Self {
            backend,
            chunks_per_batch: chunks_per_batch.max(1),
        }
    }

    pub fn chunks_per_batch(&self) -> u32 {
        self.chunks_per_batch
    }

    /// Start accumulating batches for one transfer
    pub fn writer(&self, key: TransferKey, total_chunks: u32) -> BatchWriter {
        BatchWriter {
            store: self.clone(),
            key,
            total_chunks,
            pending: HashMap::new(),
            persisted: BTreeSet::new(),
        }
    }

    /// Stream persisted batches back in index order
    pub async fn read_all<F>(&self, key: &TransferKey, mut on_batch: F) -> Result<usize>
    where
        F: FnMut(u32, Bytes) -> Result<()>,
    {
        let keys = self.backend.scan(&key.prefix()).await?;
        let count = keys.len();
        for batch_key in keys {
            let Some(batch_index) = batch_index_of(&batch_key) else {
                continue;
            };
            let data = self.backend.get(&batch_key).await?;
            on_batch(batch_index, data)?;
        }
        Ok(count)
    }

    /// Delete every batch of a finished or abandoned transfer
    pub async fn clear(&self, key: &TransferKey) -> Result<()> {
        debug!("Clearing batches for {}", key.prefix());
        self.backend.delete_prefix(&key.prefix()).await
    }
}

/// Accumulates chunks of one transfer until their batch is complete
pub struct BatchWriter {
    store: ChunkStore,
    key: TransferKey,
    total_chunks: u32,
    pending: HashMap<u32, BTreeMap<u32, Bytes>>,
    persisted: BTreeSet<u32>,
}

impl BatchWriter {
    pub fn batch_of(&self, chunk_index: u32) -> u32 {
        chunk_index / self.store.chunks_per_batch
    }

    /// Number of chunks batch `batch_index` holds when complete
    pub fn expected_in_batch(&self, batch_index: u32) -> u32 {
        let first = batch_index * self.store.chunks_per_batch;
        self.store
            .chunks_per_batch
            .min(self.total_chunks.saturating_sub(first))
    }

    pub fn batch_count(&self) -> u32 {
        self.total_chunks.div_ceil(self.store.chunks_per_batch)
    }

    pub fn persisted(&self) -> &BTreeSet<u32> {
        &self.persisted
    }

    /// Add a chunk; writes its batch when the batch becomes complete.
    ///
    /// Returns the batch index that was persisted, if any. Callers must not
    /// append the same chunk index twice.
    pub async fn append_chunk(&mut self, chunk_index: u32, data: Bytes) -> Result<Option<u32>> {
        let batch_index = self.batch_of(chunk_index);
        let expected = self.expected_in_batch(batch_index) as usize;

        let batch = self.pending.entry(batch_index).or_default();
        batch.insert(chunk_index, data);
        if batch.len() < expected {
            return Ok(None);
        }

        let Some(chunks) = self.pending.remove(&batch_index) else {
            return Ok(None);
        };
        let mut record = BytesMut::with_capacity(chunks.values().map(|c| c.len()).sum());
        for chunk in chunks.values() {
            record.extend_from_slice(chunk);
        }

        self.store
            .backend
            .put(&self.key.batch_key(batch_index), record.freeze())
            .await?;
        self.persisted.insert(batch_index);
        Ok(Some(batch_index))
    }
}
