use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

/// Per-connection reassembly buffer: data blocks arrive keyed by sequence number in any
///  order (and possibly more than once), and leave as one ordered byte stream.
///
/// This is a pure state machine - the owning connection serializes access and provides
///  the blocking/waking around it.
pub struct MessageInputStream {
    /// highest block id through which everything has been moved to the ready queue
    highest_ready_block: Option<u32>,
    /// highest block id seen at all - the ack-through value of outgoing packets
    highest_block: Option<u32>,
    /// ordered, contiguous blocks awaiting the reader
    ready_blocks: VecDeque<Bytes>,
    /// read position inside the front ready block
    ready_offset: usize,
    /// undrained ready bytes, maintained incrementally
    ready_size: usize,
    /// out-of-order blocks parked until the gap before them fills
    not_yet_ready: BTreeMap<u32, Bytes>,
    /// the peer announced it will send no more data
    close_received: bool,
    /// the block id the CLOSE packet arrived with - end-of-stream is only reached
    ///  once everything up to and including this block was delivered
    close_block_id: Option<u32>,
    /// the local reader is gone; late data is discarded but still acknowledged
    locally_closed: bool,

    max_payload_size: usize,
    max_buffer_size: usize,
}

impl MessageInputStream {
    pub fn new(max_payload_size: usize, max_buffer_size: usize) -> MessageInputStream {
        MessageInputStream {
            highest_ready_block: None,
            highest_block: None,
            ready_blocks: VecDeque::new(),
            ready_offset: 0,
            ready_size: 0,
            not_yet_ready: BTreeMap::new(),
            close_received: false,
            close_block_id: None,
            locally_closed: false,
            max_payload_size,
            max_buffer_size,
        }
    }

    pub fn highest_ready_block(&self) -> Option<u32> {
        self.highest_ready_block
    }

    /// the ack-through value for outgoing packets
    pub fn highest_block(&self) -> Option<u32> {
        self.highest_block
    }

    /// Admission check against the buffering ceiling. Duplicates and empty payloads are
    ///  always admitted; for out-of-order blocks every parked block is assumed to be
    ///  max-size so a flood of small out-of-order messages cannot pin unbounded ids.
    pub fn can_accept(&self, block_id: u32, payload_size: usize) -> bool {
        if payload_size == 0 {
            return true;
        }
        // dup of an already-ready block: always admit (and detect as dup in insert)
        if self.highest_ready_block.map_or(false, |hr| block_id <= hr) {
            return true;
        }
        if self.locally_closed {
            // only dups of parked blocks, nothing new
            return self.not_yet_ready.contains_key(&block_id);
        }
        if (self.ready_blocks.len() + self.not_yet_ready.len()) * self.max_payload_size
            < self.max_buffer_size
        {
            return true;
        }
        if self.not_yet_ready.contains_key(&block_id) {
            return true;
        }
        let available = self.max_buffer_size.saturating_sub(self.ready_size);
        if available == 0 {
            debug!("refusing block {}: reassembly buffer full", block_id);
            return false;
        }
        let allowed_blocks = (available / self.max_payload_size) as u32;
        let next = self.next_expected();
        if block_id >= next.saturating_add(allowed_blocks) {
            debug!("refusing block {}: beyond buffer window ({} allowed past {})", block_id, allowed_blocks, next);
            return false;
        }
        true
    }

    fn next_expected(&self) -> u32 {
        match self.highest_ready_block {
            Some(hr) => hr + 1,
            None => 0,
        }
    }

    /// Insert an arriving block. Returns `false` for a duplicate (no state change) -
    ///  the packet handler uses that to detect retransmission-triggered duplicates.
    pub fn insert(&mut self, block_id: u32, payload: Bytes) -> bool {
        if self.highest_ready_block.map_or(false, |hr| block_id <= hr) {
            trace!("ignoring dup block {}", block_id);
            return false;
        }
        if self.highest_block.map_or(true, |hb| block_id > hb) {
            self.highest_block = Some(block_id);
        }

        if block_id == self.next_expected() {
            self.push_ready(payload);
            self.highest_ready_block = Some(block_id);
            // drain parked blocks that are now contiguous
            while let Some(buf) = self.not_yet_ready.remove(&self.next_expected()) {
                let id = self.next_expected();
                self.push_ready(buf);
                self.highest_ready_block = Some(id);
            }
            true
        } else {
            // a gap remains before this block - park it
            if self.not_yet_ready.contains_key(&block_id) {
                trace!("ignoring dup out-of-order block {}", block_id);
                return false;
            }
            self.not_yet_ready.insert(block_id, payload);
            true
        }
    }

    fn push_ready(&mut self, payload: Bytes) {
        if self.locally_closed || payload.is_empty() {
            return;
        }
        self.ready_size += payload.len();
        self.ready_blocks.push_back(payload);
    }

    /// Every id strictly between highest-ready and highest-seen that has not arrived -
    ///  the selective-retransmission requests for outgoing packets.
    pub fn nacks(&self) -> Vec<u32> {
        let Some(highest) = self.highest_block else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        let mut id = self.next_expected();
        while id < highest {
            if !self.not_yet_ready.contains_key(&id) {
                ids.push(id);
            }
            id += 1;
        }
        ids
    }

    pub fn available(&self) -> usize {
        self.ready_size
    }

    /// Move up to `out.len()` ready bytes to the reader. Never blocks; returns 0 when
    ///  nothing is ready.
    pub fn read_available(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some(front) = self.ready_blocks.front() else {
                break;
            };
            let remaining = front.len() - self.ready_offset;
            let n = remaining.min(out.len() - copied);
            out[copied..copied + n]
                .copy_from_slice(&front[self.ready_offset..self.ready_offset + n]);
            copied += n;
            self.ready_size -= n;
            if n == remaining {
                self.ready_blocks.pop_front();
                self.ready_offset = 0;
            } else {
                self.ready_offset += n;
            }
        }
        copied
    }

    /// The peer will send nothing beyond `block_id`.
    pub fn set_close_received(&mut self, block_id: u32) {
        self.close_received = true;
        self.close_block_id = Some(block_id);
    }

    pub fn is_close_received(&self) -> bool {
        self.close_received
    }

    /// End of stream: the close marker was received, everything up to it was delivered,
    ///  and the reader drained it all.
    pub fn is_eof(&self) -> bool {
        self.close_received
            && self.ready_size == 0
            && match self.close_block_id {
                Some(close_id) => self.highest_ready_block.map_or(false, |hr| hr >= close_id),
                None => true,
            }
    }

    /// The local reader is gone: drop buffered data, keep acknowledging.
    pub fn set_locally_closed(&mut self) {
        self.locally_closed = true;
        self.ready_blocks.clear();
        self.ready_offset = 0;
        self.ready_size = 0;
    }

    pub fn is_locally_closed(&self) -> bool {
        self.locally_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn block(tag: u8, len: usize) -> Bytes {
        Bytes::from(vec![tag; len])
    }

    fn stream() -> MessageInputStream {
        MessageInputStream::new(1024, 16 * 1024)
    }

    #[rstest]
    fn test_in_order_delivery() {
        let mut s = stream();
        assert!(s.insert(0, block(0, 3)));
        assert!(s.insert(1, block(1, 3)));
        assert_eq!(s.highest_ready_block(), Some(1));
        assert_eq!(s.available(), 6);

        let mut out = [0u8; 16];
        assert_eq!(s.read_available(&mut out), 6);
        assert_eq!(&out[..6], &[0, 0, 0, 1, 1, 1]);
    }

    #[rstest]
    fn test_duplicate_insert_is_not_new_and_does_not_advance() {
        let mut s = stream();
        assert!(s.insert(0, block(0, 4)));
        let before = s.highest_ready_block();

        assert!(!s.insert(0, block(0, 4)));
        assert_eq!(s.highest_ready_block(), before);
        assert_eq!(s.available(), 4);

        // dup of a parked out-of-order block is not new either
        assert!(s.insert(2, block(2, 4)));
        assert!(!s.insert(2, block(2, 4)));
    }

    /// any permutation reassembles to the in-order concatenation
    #[rstest]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::interleaved(vec![1, 4, 0, 3, 2])]
    #[case::gap_last(vec![0, 2, 3, 4, 1])]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    fn test_out_of_order_permutations(#[case] order: Vec<u32>) {
        let mut s = stream();
        for id in order {
            assert!(s.insert(id, block(id as u8, 2)));
        }
        assert_eq!(s.highest_ready_block(), Some(4));
        assert!(s.nacks().is_empty());

        let mut out = [0u8; 16];
        assert_eq!(s.read_available(&mut out), 10);
        assert_eq!(&out[..10], &[0, 0, 1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[rstest]
    fn test_nacks_are_the_holes() {
        let mut s = stream();
        s.insert(0, block(0, 1));
        s.insert(3, block(3, 1));
        s.insert(5, block(5, 1));

        // 1, 2 and 4 are missing; 5 itself arrived and is not nacked
        assert_eq!(s.nacks(), vec![1, 2, 4]);
        assert_eq!(s.highest_block(), Some(5));

        s.insert(1, block(1, 1));
        assert_eq!(s.nacks(), vec![2, 4]);
    }

    #[rstest]
    fn test_partial_reads_keep_position() {
        let mut s = stream();
        s.insert(0, block(7, 5));

        let mut out = [0u8; 2];
        assert_eq!(s.read_available(&mut out), 2);
        assert_eq!(s.available(), 3);
        let mut rest = [0u8; 8];
        assert_eq!(s.read_available(&mut rest), 3);
        assert_eq!(s.available(), 0);
    }

    #[rstest]
    fn test_eof_requires_close_and_drained_data() {
        let mut s = stream();
        s.insert(0, block(1, 4));
        s.insert(1, Bytes::new());
        s.set_close_received(1);
        assert!(!s.is_eof());

        let mut out = [0u8; 8];
        s.read_available(&mut out);
        assert!(s.is_eof());
    }

    #[rstest]
    fn test_eof_waits_for_blocks_before_close_marker() {
        let mut s = stream();
        // close marker arrives before the data preceding it
        s.insert(2, Bytes::new());
        s.set_close_received(2);
        assert!(!s.is_eof());

        s.insert(0, block(1, 1));
        s.insert(1, block(2, 1));
        let mut out = [0u8; 8];
        s.read_available(&mut out);
        assert!(s.is_eof());
    }

    #[rstest]
    fn test_locally_closed_discards_but_acknowledges() {
        let mut s = stream();
        s.insert(0, block(1, 4));
        s.set_locally_closed();
        assert_eq!(s.available(), 0);

        assert!(s.insert(1, block(2, 4)));
        assert_eq!(s.available(), 0);
        // the block still counts for acking
        assert_eq!(s.highest_block(), Some(1));
    }

    #[rstest]
    fn test_can_accept_honors_buffer_ceiling() {
        let mut s = MessageInputStream::new(1024, 4 * 1024);
        for id in 0..4 {
            assert!(s.can_accept(id, 1024));
            s.insert(id, block(id as u8, 1024));
        }
        // buffer is full: a far-ahead block is refused
        assert!(!s.can_accept(10, 1024));
        // dups and empty payloads are always admitted
        assert!(s.can_accept(0, 1024));
        assert!(s.can_accept(10, 0));

        // draining the buffer admits new data again
        let mut out = vec![0u8; 4 * 1024];
        s.read_available(&mut out);
        assert!(s.can_accept(4, 1024));
    }
}
