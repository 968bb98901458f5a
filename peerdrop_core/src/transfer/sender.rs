use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::utils::{guess_media_type, validate_transfer_info};
use super::window::SendWindow;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::integrity::{IntegrityEngine, compute_file_hash, stream_file_hash};
use crate::link::ChannelSet;
use crate::protocol::{HashPayload, WireMessage};
use crate::{FileMetadata, PeerId, new_file_id};

/// Digest availability for a file whose hash is computed during the push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashState {
    Pending,
    Ready(String),
    Failed(String),
}

/// Random-access reader handing out one chunk at a time.
///
/// Chunk boundaries follow the announced `size`, not the file's current
/// length: bytes appended later are never sent, and a file truncated below
/// `size` fails the read.
pub struct ChunkSource {
    file: File,
    size: u64,
    chunk_size: usize,
}

impl ChunkSource {
    pub async fn open(path: &Path, size: u64, chunk_size: usize) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            size,
            chunk_size,
        })
    }

    pub async fn read_chunk(&mut self, index: u32) -> Result<Bytes> {
        let offset = index as u64 * self.chunk_size as u64;
        if offset >= self.size {
            return Err(TransferError::protocol(format!(
                "chunk {} starts beyond end of file ({} bytes)",
                index, self.size
            )));
        }
        let len = (self.chunk_size as u64).min(self.size - offset) as usize;

        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Build the metadata announced for `path`.
///
/// Files at or below the inline threshold are hashed here; larger files get
/// `hash: None` and a late `hash` message.
pub async fn prepare_metadata(path: &Path, config: &TransferConfig) -> Result<FileMetadata> {
    let stat = tokio::fs::metadata(path).await?;
    if !stat.is_file() {
        return Err(TransferError::protocol(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::protocol("invalid file name"))?
        .to_string();
    let size = stat.len();
    validate_transfer_info(&name, size, config.max_file_size)?;
    let total_chunks = FileMetadata::chunk_count(size, config.chunk_size).ok_or_else(|| {
        TransferError::protocol(format!("{} has too many chunks to announce", name))
    })?;

    let hash = if size <= config.inline_hash_threshold {
        debug!("Hashing {} ({} bytes) before announcing it", name, size);
        Some(compute_file_hash(path, size).await?)
    } else {
        None
    };

    Ok(FileMetadata {
        file_id: new_file_id(),
        media_type: guess_media_type(&name),
        total_chunks,
        chunk_size: Some(config.chunk_size as u32),
        name,
        size,
        hash,
    })
}

/// Hash the first `size` bytes of a large file concurrently with its transfer
pub fn spawn_late_hash(
    path: PathBuf,
    size: u64,
    engine: IntegrityEngine,
) -> (watch::Receiver<HashState>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(HashState::Pending);
    let handle = tokio::spawn(async move {
        let state = match stream_file_hash(&path, size, engine).await {
            Ok(hash) => HashState::Ready(hash),
            Err(e) => {
                warn!("Hashing {} failed: {}", path.display(), e);
                HashState::Failed(e.to_string())
            }
        };
        let _ = tx.send(state);
    });
    (rx, handle)
}

/// Everything one recipient's push loop needs
pub struct RecipientPush {
    pub peer_id: PeerId,
    pub metadata: FileMetadata,
    pub source_path: PathBuf,
    pub channels: ChannelSet,
    pub chunk_size: usize,
    pub window_size: u32,
    /// Chunk indices acknowledged by this recipient
    pub acks: mpsc::Receiver<u32>,
    pub hash: watch::Receiver<HashState>,
    /// Called with the new low-water mark whenever it advances
    pub on_progress: Box<dyn FnMut(u32) + Send>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushStats {
    pub chunks_sent: u32,
    pub acks_received: u32,
}

/// Push one file to one recipient: metadata, windowed chunks, hash, `end`.
///
/// A push that fails while the link is still up sends `end` anyway. The
/// recipient then fails the file on its missing chunks, answers
/// `isValid=false` and drops its batches.
pub async fn push_to_recipient(push: RecipientPush) -> Result<PushStats> {
    let channels = push.channels.clone();
    let peer_id = push.peer_id.clone();
    let result = run_push(push).await;

    if let Err(e) = &result {
        if !matches!(e, TransferError::ChannelClosed) && channels.is_open() {
            debug!("Push to {} failed ({}), ending it early", peer_id, e);
            if let Err(e) = channels.send_control(&WireMessage::End).await {
                debug!("Cannot end failed push to {}: {}", peer_id, e);
            }
        }
    }
    result
}

async fn run_push(mut push: RecipientPush) -> Result<PushStats> {
    let file_id = push.metadata.file_id.clone();
    let total = push.metadata.total_chunks;
    let mut window = SendWindow::new(total, push.window_size);
    let mut stats = PushStats::default();

    // Every channel learns which file its binary frames belong to
    push.channels
        .broadcast(&WireMessage::Metadata(push.metadata.clone()))
        .await?;
    info!(
        "Sending {} ({} bytes, {} chunks) to {}",
        push.metadata.name, push.metadata.size, total, push.peer_id
    );

    let mut source = if total > 0 {
        Some(ChunkSource::open(&push.source_path, push.metadata.size, push.chunk_size).await?)
    } else {
        None
    };
    let mut hash_sent = push.metadata.hash.is_some();

    loop {
        while let Some(index) = window.next_sendable() {
            let source = source
                .as_mut()
                .ok_or_else(|| TransferError::protocol("no chunk source for non-empty file"))?;
            let payload = source.read_chunk(index).await?;
            let frame = WireMessage::Chunk { index, payload }.encode()?;
            push.channels.channel_for(index).send(frame).await?;
            stats.chunks_sent += 1;
        }

        if window.is_complete() && hash_sent {
            break;
        }

        tokio::select! {
            ack = push.acks.recv() => {
                let Some(index) = ack else {
                    return Err(TransferError::ChannelClosed);
                };
                stats.acks_received += 1;
                if window.ack(index) {
                    (push.on_progress)(window.lowest_unacked());
                }
            }
            hash = next_hash(&mut push.hash), if !hash_sent => {
                let hash = hash?;
                debug!("Late hash for {} ready, forwarding to {}", file_id, push.peer_id);
                push.channels
                    .send_control(&WireMessage::Hash(HashPayload {
                        file_id: file_id.clone(),
                        hash,
                    }))
                    .await?;
                hash_sent = true;
            }
        }
    }

    push.channels.send_control(&WireMessage::End).await?;
    info!(
        "All {} chunks of {} acknowledged by {}",
        total, push.metadata.name, push.peer_id
    );
    Ok(stats)
}

async fn next_hash(rx: &mut watch::Receiver<HashState>) -> Result<String> {
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            HashState::Ready(hash) => return Ok(hash),
            HashState::Failed(message) => return Err(TransferError::engine(message)),
            HashState::Pending => rx
                .changed()
                .await
                .map_err(|_| TransferError::engine("hash task dropped"))?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::hash_bytes;
    use crate::link::DataChannel;
    use crate::protocol::Frame;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Records frames and acks every chunk it carries straight back
    struct AckingChannel {
        log: Arc<Mutex<Vec<WireMessage>>>,
        acks: mpsc::Sender<u32>,
    }

    #[async_trait]
    impl DataChannel for AckingChannel {
        async fn send(&self, frame: Frame) -> Result<()> {
            let msg = WireMessage::decode(frame)?;
            if let WireMessage::Chunk { index, .. } = &msg {
                let _ = self.acks.send(*index).await;
            }
            self.log.lock().unwrap().push(msg);
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    fn write_temp(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_chunk_source_reads_short_last_chunk() {
        let (_dir, path) = write_temp(&[7u8; 10]);
        let mut source = ChunkSource::open(&path, 10, 4).await.unwrap();
        assert_eq!(source.read_chunk(1).await.unwrap().len(), 4);
        assert_eq!(&source.read_chunk(2).await.unwrap()[..], &[7u8, 7]);
        assert!(source.read_chunk(3).await.is_err());
    }

    #[tokio::test]
    async fn test_chunk_source_follows_announced_size() {
        let (_dir, path) = write_temp(&[3u8; 10]);

        // Grown since it was announced at 6 bytes: the tail is never read
        let mut grown = ChunkSource::open(&path, 6, 4).await.unwrap();
        assert_eq!(grown.read_chunk(1).await.unwrap().len(), 2);
        assert!(grown.read_chunk(2).await.is_err());

        // Shrunk below the announced 16 bytes: reads past the real end fail
        let mut shrunk = ChunkSource::open(&path, 16, 4).await.unwrap();
        assert_eq!(shrunk.read_chunk(1).await.unwrap().len(), 4);
        assert!(matches!(
            shrunk.read_chunk(2).await,
            Err(TransferError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_metadata_inline_vs_late_hash() {
        let data = vec![1u8; 5000];
        let (_dir, path) = write_temp(&data);

        let inline = TransferConfig {
            chunk_size: 1024,
            ..Default::default()
        };
        let meta = prepare_metadata(&path, &inline).await.unwrap();
        assert_eq!(meta.total_chunks, 5);
        assert_eq!(meta.hash.as_deref(), Some(hash_bytes(&data).as_str()));
        assert_eq!(meta.name, "payload.bin");

        let late = TransferConfig {
            inline_hash_threshold: 100,
            ..inline
        };
        let meta = prepare_metadata(&path, &late).await.unwrap();
        assert_eq!(meta.hash, None);
    }

    #[tokio::test]
    async fn test_push_sends_hash_before_end() {
        let data = vec![9u8; 3000];
        let (_dir, path) = write_temp(&data);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let channel: Arc<dyn DataChannel> = Arc::new(AckingChannel {
            log: log.clone(),
            acks: ack_tx,
        });

        let (hash_rx, _task) = spawn_late_hash(path.clone(), 3000, IntegrityEngine::new(64));
        let metadata = FileMetadata {
            file_id: "late".into(),
            name: "payload.bin".into(),
            size: 3000,
            total_chunks: 3,
            chunk_size: Some(1000),
            hash: None,
            media_type: None,
        };

        let stats = push_to_recipient(RecipientPush {
            peer_id: "peer".into(),
            metadata,
            source_path: path,
            channels: ChannelSet::new(vec![channel], 0).unwrap(),
            chunk_size: 1000,
            window_size: 2,
            acks: ack_rx,
            hash: hash_rx,
            on_progress: Box::new(|_| {}),
        })
        .await
        .unwrap();

        assert_eq!(stats.chunks_sent, 3);
        let log = log.lock().unwrap();
        assert!(matches!(log.first(), Some(WireMessage::Metadata(_))));
        assert_eq!(log.last(), Some(&WireMessage::End));
        let hash_pos = log
            .iter()
            .position(|m| matches!(m, WireMessage::Hash(h) if h.hash == hash_bytes(&data)))
            .expect("hash message sent");
        assert!(hash_pos > 0 && hash_pos < log.len() - 1);
    }

    #[tokio::test]
    async fn test_push_one_megabyte_over_one_channel() {
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = write_temp(&data);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let channel: Arc<dyn DataChannel> = Arc::new(AckingChannel {
            log: log.clone(),
            acks: ack_tx,
        });
        let config = TransferConfig {
            chunk_size: 16384,
            ..Default::default()
        };
        let metadata = prepare_metadata(&path, &config).await.unwrap();
        assert_eq!(metadata.total_chunks, 62);

        let marks = Arc::new(Mutex::new(Vec::new()));
        let seen = marks.clone();
        let (_hash_tx, hash_rx) = watch::channel(HashState::Pending);
        let stats = push_to_recipient(RecipientPush {
            peer_id: "peer".into(),
            metadata,
            source_path: path,
            channels: ChannelSet::new(vec![channel], 0).unwrap(),
            chunk_size: 16384,
            window_size: 10,
            acks: ack_rx,
            hash: hash_rx,
            on_progress: Box::new(move |mark| seen.lock().unwrap().push(mark)),
        })
        .await
        .unwrap();

        assert_eq!(stats.chunks_sent, 62);
        assert_eq!(stats.acks_received, 62);
        assert_eq!(marks.lock().unwrap().last(), Some(&62));
        let log = log.lock().unwrap();
        assert_eq!(log.last(), Some(&WireMessage::End));
        let chunks = log
            .iter()
            .filter(|m| matches!(m, WireMessage::Chunk { .. }))
            .count();
        assert_eq!(chunks, 62);
    }

    #[tokio::test]
    async fn test_failed_push_still_ends_the_file() {
        // Announced as 3000 bytes, but only 1500 remain on disk
        let (_dir, path) = write_temp(&[5u8; 1500]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (ack_tx, ack_rx) = mpsc::channel(16);
        let channel: Arc<dyn DataChannel> = Arc::new(AckingChannel {
            log: log.clone(),
            acks: ack_tx,
        });
        let (_hash_tx, hash_rx) = watch::channel(HashState::Ready("x".into()));

        let result = push_to_recipient(RecipientPush {
            peer_id: "peer".into(),
            metadata: FileMetadata {
                file_id: "shrunk".into(),
                name: "payload.bin".into(),
                size: 3000,
                total_chunks: 3,
                chunk_size: Some(1000),
                hash: Some("x".into()),
                media_type: None,
            },
            source_path: path,
            channels: ChannelSet::new(vec![channel], 0).unwrap(),
            chunk_size: 1000,
            window_size: 4,
            acks: ack_rx,
            hash: hash_rx,
            on_progress: Box::new(|_| {}),
        })
        .await;

        assert!(matches!(result, Err(TransferError::Storage(_))));
        let log = log.lock().unwrap();
        let chunks = log
            .iter()
            .filter(|m| matches!(m, WireMessage::Chunk { .. }))
            .count();
        assert_eq!(chunks, 1);
        assert_eq!(log.last(), Some(&WireMessage::End));
    }

    #[tokio::test]
    async fn test_push_fails_when_acks_stop() {
        let (_dir, path) = write_temp(&[0u8; 100]);
        let (ack_tx, ack_rx) = mpsc::channel(4);
        drop(ack_tx);

        struct Sink;
        #[async_trait]
        impl DataChannel for Sink {
            async fn send(&self, _frame: Frame) -> Result<()> {
                Ok(())
            }
            fn is_open(&self) -> bool {
                true
            }
            fn close(&self) {}
        }

        let (_hash_tx, hash_rx) = watch::channel(HashState::Ready("x".into()));
        let result = push_to_recipient(RecipientPush {
            peer_id: "gone".into(),
            metadata: FileMetadata {
                file_id: "f".into(),
                name: "n".into(),
                size: 100,
                total_chunks: 10,
                chunk_size: Some(10),
                hash: Some("x".into()),
                media_type: None,
            },
            source_path: path,
            channels: ChannelSet::new(vec![Arc::new(Sink) as Arc<dyn DataChannel>], 0).unwrap(),
            chunk_size: 10,
            window_size: 3,
            acks: ack_rx,
            hash: hash_rx,
            on_progress: Box::new(|_| {}),
        })
        .await;

        assert!(matches!(result, Err(TransferError::ChannelClosed)));
    }
}
