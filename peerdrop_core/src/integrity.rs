//! Streaming integrity engine.
//!
//! Hashing runs on a dedicated worker thread reached only through message
//! passing: every `update` copies its bytes across the boundary and the
//! worker answers with `ChunkProcessed`, `HashResult` or `Error` signals.
//! The worker performs no reordering, so callers must feed bytes strictly in
//! file order.
//!
//! Bytes are regrouped into fixed-size hash blocks inside the worker. The
//! grouping is invisible in the digest.

use blake3::Hasher;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransferError};
use crate::transfer::constants::BUFFER_SIZE;

enum HashCommand {
    Start,
    Update(Vec<u8>),
    Finalize,
}

/// Signals emitted by the hashing worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashSignal {
    Ready,
    ChunkProcessed,
    HashResult(String),
    Error(String),
}

enum WorkerState {
    Idle,
    Hashing { hasher: Hasher, block: Vec<u8> },
    Done,
}

fn run_worker(
    block_size: usize,
    commands: std_mpsc::Receiver<HashCommand>,
    signals: mpsc::UnboundedSender<HashSignal>,
) {
    let mut state = WorkerState::Idle;

    for command in commands {
        let signal = match command {
            HashCommand::Start => {
                state = WorkerState::Hashing {
                    hasher: Hasher::new(),
                    block: Vec::with_capacity(block_size),
                };
                HashSignal::Ready
            }
            HashCommand::Update(bytes) => match &mut state {
                WorkerState::Hashing { hasher, block } => {
                    let mut rest = &bytes[..];
                    while !rest.is_empty() {
                        let take = (block_size - block.len()).min(rest.len());
                        block.extend_from_slice(&rest[..take]);
                        rest = &rest[take..];
                        if block.len() == block_size {
                            hasher.update(&block[..]);
                            block.clear();
                        }
                    }
                    HashSignal::ChunkProcessed
                }
                _ => HashSignal::Error("update outside of a hashing run".into()),
            },
            HashCommand::Finalize => match std::mem::replace(&mut state, WorkerState::Done) {
                WorkerState::Hashing { mut hasher, block } => {
                    hasher.update(&block);
                    HashSignal::HashResult(hasher.finalize().to_hex().to_string())
                }
                previous => {
                    state = previous;
                    HashSignal::Error("finalize before start".into())
                }
            },
        };

        if signals.send(signal).is_err() {
            break;
        }
    }
}

/// Factory for hashing sessions
#[derive(Debug, Clone, Copy)]
pub struct IntegrityEngine {
    block_size: usize,
}

impl IntegrityEngine {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Spawn a worker and reset its digest state.
    pub fn start(&self) -> Result<HashSession> {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let block_size = self.block_size;

        std::thread::Builder::new()
            .name("peerdrop-hasher".to_string())
            .spawn(move || run_worker(block_size, command_rx, signal_tx))
            .map_err(|e| TransferError::engine(format!("cannot spawn hash worker: {e}")))?;

        command_tx
            .send(HashCommand::Start)
            .map_err(|_| TransferError::engine("hash worker exited"))?;

        Ok(HashSession {
            commands: command_tx,
            signals: signal_rx,
            bytes_fed: 0,
            submitted: 0,
            processed: 0,
        })
    }
}

/// One in-flight digest computation.
///
/// `finalize` consumes the session, so updating after finalizing cannot be
/// expressed.
pub struct HashSession {
    commands: std_mpsc::Sender<HashCommand>,
    signals: mpsc::UnboundedReceiver<HashSignal>,
    bytes_fed: u64,
    submitted: u64,
    processed: u64,
}

impl HashSession {
    /// Feed the next bytes of the file, in file order.
    pub fn update(&mut self, bytes: &[u8]) -> Result<()> {
        self.commands
            .send(HashCommand::Update(bytes.to_vec()))
            .map_err(|_| TransferError::engine("hash worker exited"))?;
        self.bytes_fed += bytes.len() as u64;
        self.submitted += 1;
        Ok(())
    }

    /// Total bytes handed to the worker so far
    pub fn bytes_fed(&self) -> u64 {
        self.bytes_fed
    }

    /// Updates submitted but not yet acknowledged by the worker
    pub fn backlog(&mut self) -> Result<u64> {
        while let Ok(signal) = self.signals.try_recv() {
            self.observe(signal)?;
        }
        Ok(self.submitted - self.processed)
    }

    fn observe(&mut self, signal: HashSignal) -> Result<Option<String>> {
        match signal {
            HashSignal::Ready => Ok(None),
            HashSignal::ChunkProcessed => {
                self.processed += 1;
                Ok(None)
            }
            HashSignal::HashResult(digest) => Ok(Some(digest)),
            HashSignal::Error(message) => Err(TransferError::engine(message)),
        }
    }

    /// Request the digest; valid exactly once, after all bytes were fed.
    pub fn finalize(self) -> Result<PendingDigest> {
        self.commands
            .send(HashCommand::Finalize)
            .map_err(|_| TransferError::engine("hash worker exited"))?;
        debug!(
            "Digest requested after {} bytes ({} updates)",
            self.bytes_fed, self.submitted
        );
        Ok(PendingDigest { session: self })
    }
}

/// A digest request awaiting the worker's answer
pub struct PendingDigest {
    session: HashSession,
}

impl PendingDigest {
    pub async fn wait(mut self) -> Result<String> {
        while let Some(signal) = self.session.signals.recv().await {
            if let Some(digest) = self.session.observe(signal)? {
                return Ok(digest);
            }
        }
        Err(TransferError::engine("hash worker exited before digest"))
    }
}

/// One-shot digest of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Feed exactly the first `len` bytes of a file to `sink`, in order.
///
/// Bytes past `len` are ignored; a file shorter than `len` is an error.
async fn read_prefix(
    file_path: &Path,
    len: u64,
    mut sink: impl FnMut(&[u8]) -> Result<()>,
) -> Result<()> {
    let mut reader = File::open(file_path).await?.take(len);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        sink(&buffer[..n])?;
        total += n as u64;
    }

    if total != len {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!(
                "{} holds {} bytes, {} announced",
                file_path.display(),
                total,
                len
            ),
        )
        .into());
    }
    Ok(())
}

/// Compute the BLAKE3 hash of the first `len` bytes of a file
pub async fn compute_file_hash(file_path: &Path, len: u64) -> Result<String> {
    let mut hasher = Hasher::new();
    read_prefix(file_path, len, |bytes| {
        hasher.update(bytes);
        Ok(())
    })
    .await?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Hash the first `len` bytes of a file through the integrity engine
pub async fn stream_file_hash(file_path: &Path, len: u64, engine: IntegrityEngine) -> Result<String> {
    let mut session = engine.start()?;
    read_prefix(file_path, len, |bytes| session.update(bytes)).await?;
    session.finalize()?.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rng().fill(&mut data[..]);
        data
    }

    async fn digest_with(engine: IntegrityEngine, data: &[u8], split: usize) -> String {
        let mut session = engine.start().unwrap();
        for piece in data.chunks(split.max(1)) {
            session.update(piece).unwrap();
        }
        assert_eq!(session.bytes_fed(), data.len() as u64);
        session.finalize().unwrap().wait().await.unwrap()
    }

    #[tokio::test]
    async fn test_block_grouping_does_not_change_digest() {
        let data = random_bytes(100_003);
        let expected = hash_bytes(&data);

        for block_size in [1, 7, 4096, 65536, 1 << 20] {
            for split in [1000, 16384, 99_999] {
                let digest = digest_with(IntegrityEngine::new(block_size), &data, split).await;
                assert_eq!(digest, expected, "block {block_size}, split {split}");
            }
        }
    }

    #[tokio::test]
    async fn test_empty_input_digest() {
        let session = IntegrityEngine::new(1024).start().unwrap();
        let digest = session.finalize().unwrap().wait().await.unwrap();
        assert_eq!(digest, hash_bytes(&[]));
        assert_eq!(digest.len(), 64);
    }

    #[tokio::test]
    async fn test_backlog_drains() {
        let mut session = IntegrityEngine::new(16).start().unwrap();
        for _ in 0..10 {
            session.update(b"0123456789").unwrap();
        }
        assert!(session.backlog().unwrap() <= 10);
        let digest = session.finalize().unwrap().wait().await.unwrap();
        assert_eq!(digest, hash_bytes(&b"0123456789".repeat(10)));
    }

    #[test]
    fn test_worker_rejects_out_of_order_commands() {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        command_tx.send(HashCommand::Finalize).unwrap();
        command_tx.send(HashCommand::Start).unwrap();
        command_tx.send(HashCommand::Finalize).unwrap();
        command_tx.send(HashCommand::Update(vec![1])).unwrap();
        drop(command_tx);

        run_worker(8, command_rx, signal_tx);

        assert!(matches!(signal_rx.try_recv(), Ok(HashSignal::Error(_))));
        assert_eq!(signal_rx.try_recv(), Ok(HashSignal::Ready));
        assert!(matches!(signal_rx.try_recv(), Ok(HashSignal::HashResult(_))));
        assert!(matches!(signal_rx.try_recv(), Ok(HashSignal::Error(_))));
    }

    #[tokio::test]
    async fn test_file_hash_matches_streamed_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = random_bytes(3 * BUFFER_SIZE + 17);
        std::fs::write(&path, &data).unwrap();

        let len = data.len() as u64;
        let direct = compute_file_hash(&path, len).await.unwrap();
        let streamed = stream_file_hash(&path, len, IntegrityEngine::new(4096))
            .await
            .unwrap();
        assert_eq!(direct, hash_bytes(&data));
        assert_eq!(streamed, direct);
    }

    #[tokio::test]
    async fn test_file_hash_covers_only_the_announced_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grown.bin");
        let data = random_bytes(5000);
        std::fs::write(&path, &data).unwrap();

        let prefix = compute_file_hash(&path, 4000).await.unwrap();
        assert_eq!(prefix, hash_bytes(&data[..4000]));
        let streamed = stream_file_hash(&path, 4000, IntegrityEngine::new(512))
            .await
            .unwrap();
        assert_eq!(streamed, prefix);

        let short = compute_file_hash(&path, 6000).await.unwrap_err();
        assert!(matches!(short, TransferError::Storage(_)));
    }
}
