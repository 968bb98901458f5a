use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::utils::progress_percent;
use crate::{FileId, FileMetadata, PeerId};

/// Aggregate phase of one outbound file across its recipients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Pending,
    InProgress,
    Completed,
    PartiallyCompleted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Pending,
    Confirmed,
    Failed,
}

/// Final outcome reported once every recipient resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub file_id: FileId,
    pub file_name: String,
    pub phase: TransferPhase,
    pub confirmed: BTreeSet<PeerId>,
    pub failed: BTreeSet<PeerId>,
}

#[derive(Debug, Clone)]
struct Recipient {
    state: RecipientState,
    acked_chunks: u32,
}

/// Bookkeeping for one file sent to a fixed set of peers.
///
/// The recipient set is frozen at creation: peers that connect later never
/// join this transfer. Each recipient resolves once; later reports for it
/// are ignored.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    metadata: FileMetadata,
    phase: TransferPhase,
    recipients: BTreeMap<PeerId, Recipient>,
}

impl OutboundTransfer {
    pub fn new(metadata: FileMetadata, recipients: impl IntoIterator<Item = PeerId>) -> Self {
        let recipients: BTreeMap<_, _> = recipients
            .into_iter()
            .map(|peer| {
                (
                    peer,
                    Recipient {
                        state: RecipientState::Pending,
                        acked_chunks: 0,
                    },
                )
            })
            .collect();
        let phase = if recipients.is_empty() {
            TransferPhase::Aborted
        } else {
            TransferPhase::Pending
        };
        Self {
            metadata,
            phase,
            recipients,
        }
    }

    pub fn file_id(&self) -> &FileId {
        &self.metadata.file_id
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn recipients(&self) -> impl Iterator<Item = &PeerId> {
        self.recipients.keys()
    }

    pub fn recipient_state(&self, peer: &str) -> Option<RecipientState> {
        self.recipients.get(peer).map(|r| r.state)
    }

    /// Metadata went out; chunks are moving
    pub fn start(&mut self) {
        if self.phase == TransferPhase::Pending {
            self.phase = TransferPhase::InProgress;
        }
    }

    /// Record a recipient's confirmation. Returns false if ignored.
    pub fn confirm(&mut self, peer: &str, is_valid: bool) -> bool {
        let state = if is_valid {
            RecipientState::Confirmed
        } else {
            RecipientState::Failed
        };
        self.settle(peer, state)
    }

    /// The recipient's link went away or its push failed
    pub fn fail(&mut self, peer: &str) -> bool {
        self.settle(peer, RecipientState::Failed)
    }

    fn settle(&mut self, peer: &str, state: RecipientState) -> bool {
        let Some(recipient) = self.recipients.get_mut(peer) else {
            debug!("{} is not a recipient of {}", peer, self.metadata.file_id);
            return false;
        };
        if recipient.state != RecipientState::Pending {
            debug!(
                "{} already resolved for {}, ignoring {:?}",
                peer, self.metadata.file_id, state
            );
            return false;
        }
        recipient.state = state;
        true
    }

    /// Record a recipient's acknowledged-chunk low-water mark
    pub fn record_progress(&mut self, peer: &str, acked_chunks: u32) {
        if let Some(recipient) = self.recipients.get_mut(peer) {
            recipient.acked_chunks = recipient.acked_chunks.max(acked_chunks);
        }
    }

    /// Progress of the slowest pending recipient
    pub fn progress_percent(&self) -> u8 {
        let slowest = self
            .recipients
            .values()
            .filter(|r| r.state == RecipientState::Pending)
            .map(|r| r.acked_chunks)
            .min()
            .unwrap_or(self.metadata.total_chunks);
        progress_percent(slowest as u64, self.metadata.total_chunks as u64)
    }

    pub fn is_resolved(&self) -> bool {
        self.recipients
            .values()
            .all(|r| r.state != RecipientState::Pending)
    }

    /// Compute the final phase once every recipient resolved
    pub fn resolve(&mut self) -> Option<TransferSummary> {
        if !self.is_resolved() {
            return None;
        }

        let mut confirmed = BTreeSet::new();
        let mut failed = BTreeSet::new();
        for (peer, recipient) in &self.recipients {
            match recipient.state {
                RecipientState::Confirmed => confirmed.insert(peer.clone()),
                _ => failed.insert(peer.clone()),
            };
        }

        self.phase = if failed.is_empty() && !confirmed.is_empty() {
            TransferPhase::Completed
        } else if confirmed.is_empty() {
            TransferPhase::Aborted
        } else {
            TransferPhase::PartiallyCompleted
        };
        info!(
            "{} resolved as {:?} ({} confirmed, {} failed)",
            self.metadata.name,
            self.phase,
            confirmed.len(),
            failed.len()
        );

        Some(TransferSummary {
            file_id: self.metadata.file_id.clone(),
            file_name: self.metadata.name.clone(),
            phase: self.phase,
            confirmed,
            failed,
        })
    }
}
