use std::collections::BTreeSet;

/// Acknowledgement-driven sliding window over chunk indices.
///
/// Invariant: `lowest_unacked <= next_to_send <= total_chunks` and
/// `next_to_send - lowest_unacked <= width`.
#[derive(Debug, Clone)]
pub struct SendWindow {
    total_chunks: u32,
    width: u32,
    next_to_send: u32,
    lowest_unacked: u32,
    /// Acked indices above the low-water mark
    acked_ahead: BTreeSet<u32>,
}

impl SendWindow {
    pub fn new(total_chunks: u32, width: u32) -> Self {
        Self {
            total_chunks,
            width: width.max(1),
            next_to_send: 0,
            lowest_unacked: 0,
            acked_ahead: BTreeSet::new(),
        }
    }

    /// Claim the next chunk index the window allows to be sent
    pub fn next_sendable(&mut self) -> Option<u32> {
        let limit = self
            .lowest_unacked
            .saturating_add(self.width)
            .min(self.total_chunks);
        if self.next_to_send < limit {
            let index = self.next_to_send;
            self.next_to_send += 1;
            Some(index)
        } else {
            None
        }
    }

    /// Record an ack. Returns true if it advanced the low-water mark.
    ///
    /// Acks for unsent chunks, already-covered chunks and repeats are ignored.
    pub fn ack(&mut self, index: u32) -> bool {
        if index < self.lowest_unacked || index >= self.next_to_send {
            return false;
        }
        if !self.acked_ahead.insert(index) {
            return false;
        }

        let before = self.lowest_unacked;
        while self.acked_ahead.remove(&self.lowest_unacked) {
            self.lowest_unacked += 1;
        }
        self.lowest_unacked != before
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn next_to_send(&self) -> u32 {
        self.next_to_send
    }

    pub fn lowest_unacked(&self) -> u32 {
        self.lowest_unacked
    }

    pub fn in_flight(&self) -> u32 {
        self.next_to_send - self.lowest_unacked
    }

    pub fn is_complete(&self) -> bool {
        self.lowest_unacked == self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(window: &mut SendWindow) -> Vec<u32> {
        std::iter::from_fn(|| window.next_sendable()).collect()
    }

    #[test]
    fn test_window_caps_in_flight() {
        let mut window = SendWindow::new(100, 10);
        assert_eq!(drain(&mut window), (0..10).collect::<Vec<_>>());
        assert_eq!(window.in_flight(), 10);
        assert_eq!(window.next_sendable(), None);
    }

    #[test]
    fn test_out_of_order_acks_advance_only_contiguous_prefix() {
        let mut window = SendWindow::new(20, 5);
        drain(&mut window);

        assert!(!window.ack(2));
        assert!(!window.ack(1));
        assert_eq!(window.lowest_unacked(), 0);
        assert_eq!(window.next_sendable(), None);

        assert!(window.ack(0));
        assert_eq!(window.lowest_unacked(), 3);
        assert_eq!(drain(&mut window), vec![5, 6, 7]);
        assert!(window.in_flight() <= 5);
    }

    #[test]
    fn test_bogus_acks_are_ignored() {
        let mut window = SendWindow::new(10, 4);
        drain(&mut window);

        assert!(!window.ack(9)); // never sent
        assert!(window.ack(0));
        assert!(!window.ack(0)); // below low-water mark
        window.ack(2);
        assert!(!window.ack(2)); // repeat
        assert_eq!(window.lowest_unacked(), 1);
    }

    #[test]
    fn test_empty_file_is_complete_immediately() {
        let mut window = SendWindow::new(0, 10);
        assert!(window.is_complete());
        assert_eq!(window.next_sendable(), None);
    }

    #[test]
    fn test_62_chunk_scenario() {
        // 1,000,000 bytes at 16384 per chunk
        let total = crate::FileMetadata::chunk_count(1_000_000, 16384).unwrap();
        assert_eq!(total, 62);

        let mut window = SendWindow::new(total, 10);
        let mut acks = 0;
        loop {
            let sent = drain(&mut window);
            assert!(window.in_flight() <= 10);
            if sent.is_empty() && window.is_complete() {
                break;
            }
            for index in sent {
                assert!(window.lowest_unacked() < total);
                window.ack(index);
                acks += 1;
            }
        }
        assert_eq!(acks, 62);
        assert_eq!(window.lowest_unacked(), 62);
        assert_eq!(window.next_to_send(), 62);
    }

    #[test]
    fn test_low_water_reaches_total_only_on_last_ack() {
        let mut window = SendWindow::new(3, 10);
        drain(&mut window);
        window.ack(2);
        window.ack(0);
        assert!(!window.is_complete());
        assert_eq!(window.lowest_unacked(), 1);
        window.ack(1);
        assert!(window.is_complete());
    }
}
