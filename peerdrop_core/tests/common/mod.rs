#![allow(dead_code)]

use async_trait::async_trait;
use peerdrop_core::link::DataChannel;
use peerdrop_core::protocol::{Frame, WireMessage};
use peerdrop_core::store::MemoryBatchStore;
use peerdrop_core::{SessionHandle, TransferConfig, TransferEvent, spawn_session};
use rand::Rng;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Node {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<TransferEvent>,
    pub store: Arc<MemoryBatchStore>,
    pub task: JoinHandle<()>,
}

impl Node {
    pub fn spawn(config: TransferConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryBatchStore::new());
        let (handle, events, task) = spawn_session(config, store.clone()).unwrap();
        Self {
            handle,
            events,
            store,
            task,
        }
    }

    /// Skip events until one satisfies `pick`
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(&TransferEvent) -> Option<T>) -> T {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("session stopped");
                if let Some(found) = pick(&event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait until the store holds no batches (cleanup runs asynchronously)
    pub async fn wait_store_empty(&self) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while !self.store.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("store never emptied");
    }
}

/// Honour RUST_LOG in test output; repeated calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn small_config() -> TransferConfig {
    TransferConfig {
        chunk_size: 1024,
        window_size: 4,
        channels_per_peer: 3,
        control_channel: 0,
        batch_target_bytes: 8 * 1024,
        memory_window_chunks: 16,
        digest_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    data
}

pub fn write_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Channel that records every message it is asked to send
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<WireMessage>>,
}

impl Recorder {
    pub fn acks(&self) -> Vec<u32> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WireMessage::ChunkAck(ack) => Some(ack.chunk_index),
                _ => None,
            })
            .collect()
    }

    pub fn last(&self) -> Option<WireMessage> {
        self.messages.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl DataChannel for Recorder {
    async fn send(&self, frame: Frame) -> peerdrop_core::Result<()> {
        self.messages.lock().unwrap().push(WireMessage::decode(frame)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    fn close(&self) {}
}
