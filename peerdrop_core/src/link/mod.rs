//! Peer-link adapters.
//!
//! A link is a fixed-width [`ChannelSet`] per peer for outgoing frames plus
//! whatever reader machinery feeds incoming frames into the session through
//! [`SessionHandle::deliver`](crate::SessionHandle::deliver).

pub mod channel;
pub mod memory;
pub mod quic;

pub use channel::{ChannelSet, DataChannel};
