//! In-process link between two sessions (tests and loopback).

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{ChannelSet, DataChannel};
use crate::error::{Result, TransferError};
use crate::protocol::Frame;
use crate::session::SessionHandle;
use crate::PeerId;

/// One direction of one channel: frames go straight into the remote session
pub struct MemoryChannel {
    /// Id the remote session knows us by
    local_peer: PeerId,
    index: usize,
    remote: SessionHandle,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransferError::ChannelClosed);
        }
        self.remote
            .deliver(self.local_peer.clone(), self.index, frame)
            .await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

fn channel_set(
    local_peer: &str,
    remote: &SessionHandle,
    open: &Arc<AtomicBool>,
    width: usize,
    control: usize,
) -> Result<ChannelSet> {
    let channels = (0..width)
        .map(|index| {
            Arc::new(MemoryChannel {
                local_peer: local_peer.to_string(),
                index,
                remote: remote.clone(),
                open: open.clone(),
            }) as Arc<dyn DataChannel>
        })
        .collect();
    ChannelSet::new(channels, control)
}

/// A live pair of channel sets between two sessions
pub struct MemoryLink {
    a_id: PeerId,
    a: SessionHandle,
    b_id: PeerId,
    b: SessionHandle,
    open: Arc<AtomicBool>,
}

/// Link session `a` (known to `b` as `a_id`) with session `b` (known as `b_id`)
pub async fn connect(
    a_id: &str,
    a: &SessionHandle,
    b_id: &str,
    b: &SessionHandle,
    width: usize,
    control: usize,
) -> Result<MemoryLink> {
    let open = Arc::new(AtomicBool::new(true));
    let a_to_b = channel_set(a_id, b, &open, width, control)?;
    let b_to_a = channel_set(b_id, a, &open, width, control)?;

    a.peer_link(b_id, a_to_b).await?;
    b.peer_link(a_id, b_to_a).await?;
    debug!("Memory link {} <-> {} ({} channels)", a_id, b_id, width);

    Ok(MemoryLink {
        a_id: a_id.to_string(),
        a: a.clone(),
        b_id: b_id.to_string(),
        b: b.clone(),
        open,
    })
}

impl MemoryLink {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Drop the link and report the departure to both sides
    pub async fn sever(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Severing memory link {} <-> {}", self.a_id, self.b_id);
        let _ = self.a.peer_gone(self.b_id.clone()).await;
        let _ = self.b.peer_gone(self.a_id.clone()).await;
    }
}
