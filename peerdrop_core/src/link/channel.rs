use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TransferError};
use crate::protocol::{Frame, WireMessage};

/// One message-oriented channel of a peer link
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Fixed-width set of parallel channels to one peer.
///
/// Chunk `i` always travels on channel `i mod N`; control traffic uses the
/// designated control channel.
#[derive(Clone)]
pub struct ChannelSet {
    channels: Arc<[Arc<dyn DataChannel>]>,
    control: usize,
}

impl ChannelSet {
    pub fn new(channels: Vec<Arc<dyn DataChannel>>, control: usize) -> Result<Self> {
        if channels.is_empty() {
            return Err(TransferError::protocol("channel set needs at least one channel"));
        }
        if control >= channels.len() {
            return Err(TransferError::protocol(format!(
                "control channel {} out of range for {} channels",
                control,
                channels.len()
            )));
        }
        Ok(Self {
            channels: channels.into(),
            control,
        })
    }

    pub fn width(&self) -> usize {
        self.channels.len()
    }

    pub fn control_index(&self) -> usize {
        self.control
    }

    pub fn control(&self) -> &Arc<dyn DataChannel> {
        &self.channels[self.control]
    }

    /// Round-robin placement of a chunk
    pub fn channel_for(&self, chunk_index: u32) -> &Arc<dyn DataChannel> {
        &self.channels[chunk_index as usize % self.channels.len()]
    }

    /// A set is usable while its control channel is open
    pub fn is_open(&self) -> bool {
        self.control().is_open()
    }

    pub async fn send_control(&self, msg: &WireMessage) -> Result<()> {
        self.control().send(msg.encode()?).await
    }

    /// Send the same message on every channel
    pub async fn broadcast(&self, msg: &WireMessage) -> Result<()> {
        let frame = msg.encode()?;
        for channel in self.channels.iter() {
            channel.send(frame.clone()).await?;
        }
        Ok(())
    }

    pub fn close_all(&self) {
        for channel in self.channels.iter() {
            channel.close();
        }
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSet")
            .field("width", &self.channels.len())
            .field("control", &self.control)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Frame>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl DataChannel for Recorder {
        async fn send(&self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn recorders(n: usize) -> Vec<Arc<Recorder>> {
        (0..n).map(|_| Arc::new(Recorder::default())).collect()
    }

    fn as_set(recorders: &[Arc<Recorder>], control: usize) -> ChannelSet {
        let channels = recorders
            .iter()
            .map(|r| r.clone() as Arc<dyn DataChannel>)
            .collect();
        ChannelSet::new(channels, control).unwrap()
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(ChannelSet::new(Vec::new(), 0).is_err());
        let recs = recorders(2);
        let channels: Vec<Arc<dyn DataChannel>> =
            recs.iter().map(|r| r.clone() as Arc<dyn DataChannel>).collect();
        assert!(ChannelSet::new(channels, 2).is_err());
    }

    #[tokio::test]
    async fn test_round_robin_and_control() {
        let recs = recorders(3);
        let set = as_set(&recs, 1);

        for index in 0..7u32 {
            set.channel_for(index)
                .send(Frame::Binary(bytes::Bytes::from(vec![index as u8])))
                .await
                .unwrap();
        }
        set.send_control(&WireMessage::End).await.unwrap();

        assert_eq!(recs[0].frames.lock().unwrap().len(), 3); // 0, 3, 6
        assert_eq!(recs[1].frames.lock().unwrap().len(), 3); // 1, 4, end
        assert_eq!(recs[2].frames.lock().unwrap().len(), 2); // 2, 5
        assert_eq!(
            recs[1].frames.lock().unwrap().last(),
            Some(&Frame::Text("end".to_string()))
        );
    }

    #[tokio::test]
    async fn test_broadcast_and_close() {
        let recs = recorders(2);
        let set = as_set(&recs, 0);
        set.broadcast(&WireMessage::End).await.unwrap();
        assert!(recs.iter().all(|r| r.frames.lock().unwrap().len() == 1));

        assert!(set.is_open());
        set.close_all();
        assert!(!set.is_open());
    }
}
