use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SessionCommand;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::integrity::IntegrityEngine;
use crate::link::ChannelSet;
use crate::protocol::{ChunkAckPayload, ConfirmationPayload, Frame, HashPayload, WireMessage};
use crate::store::{BatchStore, ChunkStore, TransferKey};
use crate::transfer::sender::spawn_late_hash;
use crate::transfer::utils::progress_percent;
use crate::transfer::{
    ChunkOutcome, HashState, InboundTransfer, OutboundTransfer, RecipientPush, prepare_metadata,
    push_to_recipient,
};
use crate::{Direction, FileId, FileMetadata, PeerId, TransferEvent};

/// How many finished inbound keys are remembered for late-message detection
const RECENT_TRANSFERS: usize = 64;

/// Acks buffered per outbound push
const ACK_QUEUE_CAPACITY: usize = 1024;

struct PeerState {
    channels: ChannelSet,
    /// File most recently announced on each channel; binary chunks belong to it
    current_file: Vec<Option<FileId>>,
    /// One outbound file at a time per peer
    send_lane: Arc<Mutex<()>>,
    ack_routes: HashMap<FileId, mpsc::Sender<u32>>,
    pushes: HashMap<FileId, JoinHandle<()>>,
}

impl PeerState {
    fn new(channels: ChannelSet) -> Self {
        Self {
            current_file: vec![None; channels.width()],
            channels,
            send_lane: Arc::new(Mutex::new(())),
            ack_routes: HashMap::new(),
            pushes: HashMap::new(),
        }
    }

    fn stop_push(&mut self, file_id: &str) {
        self.ack_routes.remove(file_id);
        if let Some(task) = self.pushes.remove(file_id) {
            task.abort();
        }
    }

    fn teardown(&mut self) {
        self.ack_routes.clear();
        for (_, task) in self.pushes.drain() {
            task.abort();
        }
        self.channels.close_all();
    }
}

struct Outbound {
    transfer: OutboundTransfer,
    hash_task: Option<JoinHandle<()>>,
    last_percent: u8,
}

enum InboundSlot {
    Receiving(InboundTransfer),
    Finalizing {
        file_name: String,
        expected_hash: Arc<watch::Sender<Option<String>>>,
        task: JoinHandle<()>,
    },
}

impl InboundSlot {
    fn file_name(&self) -> &str {
        match self {
            InboundSlot::Receiving(transfer) => &transfer.metadata().name,
            InboundSlot::Finalizing { file_name, .. } => file_name,
        }
    }
}

pub(super) struct SessionActor {
    config: TransferConfig,
    store: ChunkStore,
    engine: IntegrityEngine,
    commands: mpsc::Receiver<SessionCommand>,
    self_tx: mpsc::WeakSender<SessionCommand>,
    events: mpsc::Sender<TransferEvent>,
    peers: HashMap<PeerId, PeerState>,
    outbound: HashMap<FileId, Outbound>,
    inbound: HashMap<TransferKey, InboundSlot>,
    recently_resolved: VecDeque<TransferKey>,
}

impl SessionActor {
    pub(super) fn new(
        config: TransferConfig,
        backend: Arc<dyn BatchStore>,
        commands: mpsc::Receiver<SessionCommand>,
        self_tx: mpsc::WeakSender<SessionCommand>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Self {
        Self {
            store: ChunkStore::new(backend, config.chunks_per_batch()),
            engine: IntegrityEngine::new(config.hash_block_size),
            config,
            commands,
            self_tx,
            events,
            peers: HashMap::new(),
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            recently_resolved: VecDeque::with_capacity(RECENT_TRANSFERS),
        }
    }

    pub(super) async fn run(mut self) {
        info!("Transfer session started");
        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::PeerLink { peer_id, channels } => {
                    self.on_peer_link(peer_id, channels).await
                }
                SessionCommand::PeerGone { peer_id } => self.on_peer_gone(&peer_id).await,
                SessionCommand::Frame {
                    peer_id,
                    channel,
                    frame,
                } => self.on_frame(&peer_id, channel, frame).await,
                SessionCommand::SendFile { path, reply } => {
                    let result = self.on_send_file(path).await;
                    let _ = reply.send(result);
                }
                SessionCommand::PushProgress {
                    file_id,
                    peer_id,
                    acked,
                } => self.on_push_progress(&file_id, &peer_id, acked).await,
                SessionCommand::PushFinished {
                    file_id,
                    peer_id,
                    result,
                } => self.on_push_finished(&file_id, &peer_id, result).await,
                SessionCommand::FinalizeDone { key, result } => {
                    self.on_finalize_done(key, result).await
                }
                SessionCommand::Shutdown => break,
            }
        }
        self.shutdown().await;
        info!("Transfer session stopped");
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event).await;
    }

    fn command_sender(&self) -> Result<mpsc::Sender<SessionCommand>> {
        self.self_tx.upgrade().ok_or(TransferError::SessionClosed)
    }

    async fn on_peer_link(&mut self, peer_id: PeerId, channels: ChannelSet) {
        if self.peers.contains_key(&peer_id) {
            warn!("{} linked again, dropping the previous link", peer_id);
            self.on_peer_gone(&peer_id).await;
        }
        info!(
            "Peer {} linked with {} channels (control {})",
            peer_id,
            channels.width(),
            channels.control_index()
        );
        self.peers.insert(peer_id.clone(), PeerState::new(channels));
        self.emit(TransferEvent::Status(format!("Connected to {peer_id}")))
            .await;
    }

    /// Full teardown of everything involving `peer_id`
    async fn on_peer_gone(&mut self, peer_id: &str) {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            debug!("peer_gone for unknown peer {}", peer_id);
            return;
        };
        info!("Peer {} gone", peer_id);
        peer.teardown();

        let affected: Vec<FileId> = self
            .outbound
            .iter_mut()
            .filter_map(|(file_id, out)| out.transfer.fail(peer_id).then(|| file_id.clone()))
            .collect();
        for file_id in affected {
            self.maybe_resolve(&file_id).await;
        }

        let keys: Vec<TransferKey> = self
            .inbound
            .keys()
            .filter(|key| key.peer_id == peer_id)
            .cloned()
            .collect();
        for key in keys {
            self.release_inbound(&key).await;
        }

        self.emit(TransferEvent::Status(format!("{peer_id} disconnected")))
            .await;
    }

    async fn on_send_file(&mut self, path: PathBuf) -> Result<FileId> {
        let metadata = prepare_metadata(&path, &self.config).await?;
        let file_id = metadata.file_id.clone();

        // Recipients are frozen now; later peers never join this transfer
        let recipients: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.channels.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        let mut transfer = OutboundTransfer::new(metadata.clone(), recipients.clone());

        if recipients.is_empty() {
            warn!("No linked peers, {} is not sent", metadata.name);
            self.outbound.insert(
                file_id.clone(),
                Outbound {
                    transfer,
                    hash_task: None,
                    last_percent: 0,
                },
            );
            self.maybe_resolve(&file_id).await;
            return Ok(file_id);
        }

        let (hash_rx, hash_task) = match &metadata.hash {
            Some(hash) => {
                let (_, rx) = watch::channel(HashState::Ready(hash.clone()));
                (rx, None)
            }
            None => {
                let (rx, task) = spawn_late_hash(path.clone(), metadata.size, self.engine);
                (rx, Some(task))
            }
        };

        let tx = self.command_sender()?;
        for peer_id in &recipients {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                continue;
            };
            let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_CAPACITY);
            peer.ack_routes.insert(file_id.clone(), ack_tx);

            let progress_tx = tx.clone();
            let progress_file = file_id.clone();
            let progress_peer = peer_id.clone();
            let push = RecipientPush {
                peer_id: peer_id.clone(),
                metadata: metadata.clone(),
                source_path: path.clone(),
                channels: peer.channels.clone(),
                chunk_size: self.config.chunk_size,
                window_size: self.config.window_size,
                acks: ack_rx,
                hash: hash_rx.clone(),
                on_progress: Box::new(move |acked| {
                    let _ = progress_tx.try_send(SessionCommand::PushProgress {
                        file_id: progress_file.clone(),
                        peer_id: progress_peer.clone(),
                        acked,
                    });
                }),
            };

            let lane = peer.send_lane.clone();
            let done_tx = tx.clone();
            let done_file = file_id.clone();
            let done_peer = peer_id.clone();
            let task = tokio::spawn(async move {
                let _lane = lane.lock().await;
                let result = push_to_recipient(push).await.map(|stats| {
                    debug!(
                        "Push of {} to {} done: {} chunks, {} acks",
                        done_file, done_peer, stats.chunks_sent, stats.acks_received
                    );
                });
                let _ = done_tx
                    .send(SessionCommand::PushFinished {
                        file_id: done_file,
                        peer_id: done_peer,
                        result,
                    })
                    .await;
            });
            peer.pushes.insert(file_id.clone(), task);
        }

        transfer.start();
        info!(
            "Sending {} to {} peer(s) as {}",
            metadata.name,
            recipients.len(),
            file_id
        );
        self.outbound.insert(
            file_id.clone(),
            Outbound {
                transfer,
                hash_task,
                last_percent: 0,
            },
        );
        self.emit(TransferEvent::Status(format!(
            "Sending {} to {} peer(s)",
            metadata.name,
            recipients.len()
        )))
        .await;
        Ok(file_id)
    }

    async fn on_push_progress(&mut self, file_id: &str, peer_id: &str, acked: u32) {
        let Some(out) = self.outbound.get_mut(file_id) else {
            return;
        };
        out.transfer.record_progress(peer_id, acked);
        let percent = out.transfer.progress_percent();
        if percent == out.last_percent {
            return;
        }
        out.last_percent = percent;
        self.emit(TransferEvent::Progress {
            file_id: file_id.to_string(),
            percent,
            direction: Direction::Sending,
        })
        .await;
    }

    async fn on_push_finished(&mut self, file_id: &str, peer_id: &str, result: Result<()>) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.ack_routes.remove(file_id);
            peer.pushes.remove(file_id);
        }

        // Success still waits for the recipient's confirmation
        let Err(e) = result else {
            return;
        };
        if e.is_recoverable() {
            warn!("Push of {} to {} failed: {}", file_id, peer_id, e);
        } else {
            error!("Push of {} to {} failed: {}", file_id, peer_id, e);
        }
        let failed = self
            .outbound
            .get_mut(file_id)
            .is_some_and(|out| out.transfer.fail(peer_id));
        if failed {
            self.emit(TransferEvent::Error(format!(
                "Sending to {peer_id} failed: {e}"
            )))
            .await;
            self.maybe_resolve(file_id).await;
        }
    }

    /// Emit the outcome once every initial recipient is accounted for
    async fn maybe_resolve(&mut self, file_id: &str) {
        let Some(out) = self.outbound.get_mut(file_id) else {
            return;
        };
        let Some(summary) = out.transfer.resolve() else {
            return;
        };
        if let Some(out) = self.outbound.remove(file_id) {
            if let Some(task) = out.hash_task {
                task.abort();
            }
        }
        for peer in self.peers.values_mut() {
            peer.stop_push(file_id);
        }

        self.emit(TransferEvent::TransferOutcome {
            file_id: file_id.to_string(),
            summary,
        })
        .await;
        if self.outbound.is_empty() {
            self.emit(TransferEvent::SendQueueDrained).await;
        }
    }

    async fn on_frame(&mut self, peer_id: &str, channel: usize, frame: Frame) {
        let message = match WireMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", peer_id, e);
                return;
            }
        };

        let Some(peer) = self.peers.get_mut(peer_id) else {
            debug!("Frame from unlinked peer {}", peer_id);
            return;
        };
        if channel >= peer.current_file.len() {
            debug!("Frame on unknown channel {} of {}", channel, peer_id);
            return;
        }

        match message {
            WireMessage::Metadata(metadata) => {
                peer.current_file[channel] = Some(metadata.file_id.clone());
                self.on_metadata(peer_id, metadata).await;
            }
            WireMessage::Hash(payload) => self.on_hash(peer_id, payload),
            WireMessage::Chunk { index, payload } => {
                let Some(file_id) = peer.current_file[channel].clone() else {
                    debug!("Chunk {} before metadata on channel {}", index, channel);
                    return;
                };
                self.on_chunk(TransferKey::new(peer_id, file_id), index, payload)
                    .await;
            }
            WireMessage::ChunkAck(payload) => Self::route_ack(peer, payload),
            WireMessage::End => {
                let Some(file_id) = peer.current_file[channel].clone() else {
                    debug!("end before metadata on channel {}", channel);
                    return;
                };
                self.on_end(TransferKey::new(peer_id, file_id)).await;
            }
            WireMessage::Confirmation(payload) => self.on_confirmation(peer_id, payload).await,
        }
    }

    fn route_ack(peer: &mut PeerState, ack: ChunkAckPayload) {
        match peer.ack_routes.get(&ack.file_id) {
            Some(route) => {
                if route.try_send(ack.chunk_index).is_err() {
                    debug!("Dropping ack {} for {}", ack.chunk_index, ack.file_id);
                }
            }
            None => debug!("Ack for inactive transfer {}", ack.file_id),
        }
    }

    async fn on_metadata(&mut self, peer_id: &str, metadata: FileMetadata) {
        let key = TransferKey::new(peer_id, metadata.file_id.clone());
        // Metadata is repeated on every channel; only the first one counts
        if self.inbound.contains_key(&key) || self.recently_resolved.contains(&key) {
            return;
        }

        match InboundTransfer::new(
            key.clone(),
            metadata.clone(),
            &self.config,
            &self.store,
            self.engine,
        ) {
            Ok(transfer) => {
                info!(
                    "Receiving {} ({} bytes, {} chunks) from {}",
                    metadata.name, metadata.size, metadata.total_chunks, peer_id
                );
                self.inbound.insert(key, InboundSlot::Receiving(transfer));
                self.emit(TransferEvent::Status(format!(
                    "Receiving {} from {}",
                    metadata.name, peer_id
                )))
                .await;
            }
            Err(e) => {
                warn!("Refusing {} from {}: {}", metadata.name, peer_id, e);
                self.remember_resolved(key.clone());
                self.send_confirmation(&key, &metadata.name, false).await;
            }
        }
    }

    fn on_hash(&self, peer_id: &str, payload: HashPayload) {
        let key = TransferKey::new(peer_id, payload.file_id);
        match self.inbound.get(&key) {
            Some(InboundSlot::Receiving(transfer)) => transfer.set_expected_hash(payload.hash),
            Some(InboundSlot::Finalizing { expected_hash, .. }) => {
                expected_hash.send_replace(Some(payload.hash));
            }
            None if self.recently_resolved.contains(&key) => {
                warn!(
                    "Hash for {} from {} arrived after the transfer was resolved; ignoring it",
                    key.file_id, peer_id
                );
            }
            None => debug!("Hash for unknown transfer {}", key.file_id),
        }
    }

    async fn on_chunk(&mut self, key: TransferKey, index: u32, payload: Bytes) {
        let Some(InboundSlot::Receiving(transfer)) = self.inbound.get_mut(&key) else {
            debug!("Chunk {} for inactive transfer {}", index, key.file_id);
            return;
        };

        let outcome = transfer.accept_chunk(index, payload).await;
        let ack = transfer.ack_for(index);
        let received = transfer.received_count() as u64;
        let total = transfer.metadata().total_chunks as u64;

        match outcome {
            Ok(ChunkOutcome::Accepted) => {}
            Ok(ChunkOutcome::Duplicate) => {
                debug!("Duplicate chunk {} of {}", index, key.file_id);
                return;
            }
            Ok(ChunkOutcome::Rejected(reason)) => {
                debug!("Rejected chunk of {}: {}", key.file_id, reason);
                return;
            }
            Err(e) => {
                self.fail_inbound(&key, e).await;
                return;
            }
        }

        if let Some(peer) = self.peers.get(&key.peer_id) {
            if let Err(e) = peer.channels.send_control(&WireMessage::ChunkAck(ack)).await {
                warn!("Cannot ack chunk {} to {}: {}", index, key.peer_id, e);
            }
        }

        let percent = progress_percent(received, total);
        if percent != progress_percent(received - 1, total) {
            self.emit(TransferEvent::Progress {
                file_id: key.file_id.clone(),
                percent,
                direction: Direction::Receiving,
            })
            .await;
        }
    }

    async fn on_end(&mut self, key: TransferKey) {
        let mut transfer = match self.inbound.remove(&key) {
            Some(InboundSlot::Receiving(transfer)) => transfer,
            Some(other) => {
                debug!("Repeated end for {}", key.file_id);
                self.inbound.insert(key, other);
                return;
            }
            None => {
                debug!("end for unknown transfer {}", key.file_id);
                return;
            }
        };

        let tx = match self.command_sender() {
            Ok(tx) => tx,
            Err(e) => {
                error!("Cannot finalize {}: {}", key.file_id, e);
                return;
            }
        };
        transfer.mark_ending();
        debug!(
            "end received for {} ({}/{} chunks, digest deferred: {})",
            key.file_id,
            transfer.received_count(),
            transfer.metadata().total_chunks,
            transfer.digest_deferred()
        );

        let file_name = transfer.metadata().name.clone();
        let expected_hash = transfer.expected_hash_handle();
        let store = self.store.clone();
        let timeout = self.config.digest_timeout;
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let result = transfer.finalize(&store, timeout).await;
            let _ = tx
                .send(SessionCommand::FinalizeDone {
                    key: task_key,
                    result,
                })
                .await;
        });

        self.inbound.insert(
            key,
            InboundSlot::Finalizing {
                file_name,
                expected_hash,
                task,
            },
        );
    }

    async fn on_finalize_done(&mut self, key: TransferKey, result: Result<Bytes>) {
        let Some(InboundSlot::Finalizing { file_name, .. }) = self.inbound.get(&key) else {
            debug!("Finalize result for torn-down transfer {}", key.file_id);
            return;
        };
        let file_name = file_name.clone();

        match result {
            Ok(data) => {
                info!(
                    "Received {} ({} bytes) from {}",
                    file_name,
                    data.len(),
                    key.peer_id
                );
                self.send_confirmation(&key, &file_name, true).await;
                self.release_inbound(&key).await;
                self.emit(TransferEvent::Progress {
                    file_id: key.file_id.clone(),
                    percent: 100,
                    direction: Direction::Receiving,
                })
                .await;
                self.emit(TransferEvent::FileReceived {
                    file_id: key.file_id.clone(),
                    name: file_name,
                    data,
                    sender: key.peer_id.clone(),
                })
                .await;
            }
            Err(e) => self.fail_inbound(&key, e).await,
        }
    }

    /// Failure exit for an inbound transfer: confirm `isValid=false`, release, report
    async fn fail_inbound(&mut self, key: &TransferKey, e: TransferError) {
        let file_name = self
            .inbound
            .get(key)
            .map(|slot| slot.file_name().to_string())
            .unwrap_or_default();
        warn!("Receiving {} from {} failed: {}", file_name, key.peer_id, e);

        self.send_confirmation(key, &file_name, false).await;
        self.release_inbound(key).await;
        self.emit(TransferEvent::Error(format!(
            "Receiving {file_name} from {} failed: {e}",
            key.peer_id
        )))
        .await;
    }

    /// Single cleanup routine for every inbound exit path; safe to repeat
    async fn release_inbound(&mut self, key: &TransferKey) {
        if let Some(InboundSlot::Finalizing { task, .. }) = self.inbound.remove(key) {
            task.abort();
        }
        if let Err(e) = self.store.clear(key).await {
            warn!("Cannot clear batches of {}: {}", key.file_id, e);
        }
        self.remember_resolved(key.clone());
    }

    fn remember_resolved(&mut self, key: TransferKey) {
        if self.recently_resolved.contains(&key) {
            return;
        }
        if self.recently_resolved.len() == RECENT_TRANSFERS {
            self.recently_resolved.pop_front();
        }
        self.recently_resolved.push_back(key);
    }

    async fn send_confirmation(&self, key: &TransferKey, file_name: &str, is_valid: bool) {
        let Some(peer) = self.peers.get(&key.peer_id) else {
            return;
        };
        if !peer.channels.is_open() {
            return;
        }
        let message = WireMessage::Confirmation(ConfirmationPayload {
            file_id: key.file_id.clone(),
            file_name: file_name.to_string(),
            is_valid,
        });
        if let Err(e) = peer.channels.send_control(&message).await {
            warn!("Cannot confirm {} to {}: {}", key.file_id, key.peer_id, e);
        }
    }

    async fn on_confirmation(&mut self, peer_id: &str, payload: ConfirmationPayload) {
        let Some(out) = self.outbound.get_mut(&payload.file_id) else {
            debug!("Confirmation for unknown transfer {}", payload.file_id);
            return;
        };
        if !out.transfer.confirm(peer_id, payload.is_valid) {
            return;
        }
        if payload.is_valid {
            info!("{} confirmed {}", peer_id, payload.file_name);
        } else {
            warn!("{} rejected {}", peer_id, payload.file_name);
            self.emit(TransferEvent::Error(format!(
                "{peer_id} could not validate {}",
                payload.file_name
            )))
            .await;
        }
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.stop_push(&payload.file_id);
        }
        self.maybe_resolve(&payload.file_id).await;
    }

    async fn shutdown(&mut self) {
        for (_, mut peer) in self.peers.drain() {
            peer.teardown();
        }
        for (_, out) in self.outbound.drain() {
            if let Some(task) = out.hash_task {
                task.abort();
            }
        }
        let keys: Vec<TransferKey> = self.inbound.keys().cloned().collect();
        for key in keys {
            self.release_inbound(&key).await;
        }
    }
}
