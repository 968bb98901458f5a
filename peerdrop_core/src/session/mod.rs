//! Session actor: one task owns every per-peer and per-file map.
//!
//! Link adapters, push tasks and finalize tasks talk to it through
//! [`SessionCommand`]s; callers use the cloneable [`SessionHandle`] and read
//! [`TransferEvent`]s from the returned receiver.

mod actor;

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::link::ChannelSet;
use crate::protocol::Frame;
use crate::store::{BatchStore, TransferKey};
use crate::{FileId, PeerId, TransferEvent};

/// Capacity of the session command queue and the event queue
const QUEUE_CAPACITY: usize = 1024;

pub(crate) enum SessionCommand {
    PeerLink {
        peer_id: PeerId,
        channels: ChannelSet,
    },
    PeerGone {
        peer_id: PeerId,
    },
    Frame {
        peer_id: PeerId,
        channel: usize,
        frame: Frame,
    },
    SendFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<FileId>>,
    },
    PushProgress {
        file_id: FileId,
        peer_id: PeerId,
        acked: u32,
    },
    PushFinished {
        file_id: FileId,
        peer_id: PeerId,
        result: Result<()>,
    },
    FinalizeDone {
        key: TransferKey,
        result: Result<Bytes>,
    },
    Shutdown,
}

/// Cloneable front door of a running session
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TransferError::SessionClosed)
    }

    /// Send a file to every peer linked right now. Returns its file id.
    pub async fn send_file(&self, path: impl Into<PathBuf>) -> Result<FileId> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SendFile {
            path: path.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TransferError::SessionClosed)?
    }

    /// A usable channel set to `peer_id` is ready
    pub async fn peer_link(&self, peer_id: impl Into<PeerId>, channels: ChannelSet) -> Result<()> {
        self.send(SessionCommand::PeerLink {
            peer_id: peer_id.into(),
            channels,
        })
        .await
    }

    /// `peer_id` disconnected
    pub async fn peer_gone(&self, peer_id: impl Into<PeerId>) -> Result<()> {
        self.send(SessionCommand::PeerGone {
            peer_id: peer_id.into(),
        })
        .await
    }

    /// Hand a frame read from channel `channel` of `peer_id` to the session
    pub async fn deliver(&self, peer_id: impl Into<PeerId>, channel: usize, frame: Frame) -> Result<()> {
        self.send(SessionCommand::Frame {
            peer_id: peer_id.into(),
            channel,
            frame,
        })
        .await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }
}

/// Start a session actor on the current runtime.
pub fn spawn_session(
    config: TransferConfig,
    backend: Arc<dyn BatchStore>,
) -> Result<(SessionHandle, mpsc::Receiver<TransferEvent>, JoinHandle<()>)> {
    config.validate()?;

    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(QUEUE_CAPACITY);
    let actor = actor::SessionActor::new(config, backend, rx, tx.downgrade(), event_tx);
    let task = tokio::spawn(actor.run());

    Ok((SessionHandle { tx }, event_rx, task))
}
