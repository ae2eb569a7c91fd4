//! Receive buffer.
//!
//! Holds segments that arrived but have not been read by the application,
//! in sequence order and possibly with gaps:
//!
//! ```text
//!  read by app     next_rx                     max_rx_sequence
//!  ───────────┤◀ avail ▶┤   [ooo]   [ooo]          │
//!             └ extract ┘    └ SACK blocks ┘       └ window edge
//! ```
//!
//! `next_rx` only advances when the byte just below it is present, so what
//! [`RxBuffer::extract`] returns is always contiguous.

use std::collections::VecDeque;

use crate::packet::SackBlock;
use crate::seq::SequenceNumber;

#[derive(Debug)]
pub struct RxBuffer {
    /// `(first sequence, bytes)` runs, sorted and non-overlapping.
    data: Vec<(SequenceNumber, Vec<u8>)>,
    next_rx_seq: SequenceNumber,
    /// Bytes held, in order or not.
    size: u32,
    /// In-order bytes ready for the application.
    avail: u32,
    max_buffer: u32,
    got_fin: bool,
    fin_seq: SequenceNumber,
    sack_list: VecDeque<SackBlock>,
}

impl RxBuffer {
    pub fn new(next_rx_seq: SequenceNumber) -> Self {
        Self {
            data: Vec::new(),
            next_rx_seq,
            size: 0,
            avail: 0,
            max_buffer: 32_768,
            got_fin: false,
            fin_seq: SequenceNumber::default(),
            sack_list: VecDeque::new(),
        }
    }

    /// Next in-order byte expected (RCV.NXT).
    pub fn next_rx_sequence(&self) -> SequenceNumber {
        self.next_rx_seq
    }

    pub fn set_next_rx_sequence(&mut self, seq: SequenceNumber) {
        self.next_rx_seq = seq;
    }

    pub fn max_buffer_size(&self) -> u32 {
        self.max_buffer
    }

    pub fn set_max_buffer_size(&mut self, n: u32) {
        self.max_buffer = n;
    }

    /// Bytes held, including out-of-order ones.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// In-order bytes ready for [`RxBuffer::extract`].
    pub fn available(&self) -> u32 {
        self.avail
    }

    /// Right edge of the receive window.
    pub fn max_rx_sequence(&self) -> SequenceNumber {
        self.next_rx_seq + self.max_buffer.saturating_sub(self.avail)
    }

    /// Blocks to advertise, most recently changed first.
    pub fn sack_list(&self) -> impl Iterator<Item = &SackBlock> {
        self.sack_list.iter()
    }

    pub fn sack_list_len(&self) -> usize {
        self.sack_list.len()
    }

    /// Record the peer's FIN at `seq`.  It is consumed (RCV.NXT moves past
    /// it) once every byte before it has arrived.
    pub fn set_fin_sequence(&mut self, seq: SequenceNumber) {
        self.got_fin = true;
        self.fin_seq = seq;
        if self.next_rx_seq == seq {
            self.next_rx_seq += 1;
        }
    }

    /// `true` once the FIN has been consumed.
    pub fn finished(&self) -> bool {
        self.got_fin && self.fin_seq < self.next_rx_seq
    }

    /// Store `payload` received at `seq`.
    ///
    /// The segment is trimmed to the receive window and to bytes not
    /// already held.  Returns `false` if nothing of it was stored.
    pub fn add(&mut self, seq: SequenceNumber, payload: &[u8]) -> bool {
        let mut head = seq;
        let mut tail = seq + payload.len() as u32;

        if head < self.next_rx_seq {
            head = self.next_rx_seq;
        }
        let max_seq = self.max_rx_sequence();
        if max_seq < tail {
            tail = max_seq;
        }
        if tail < head {
            head = tail;
        }

        // Remove overlap with what we already hold.
        let mut i = 0;
        while i < self.data.len() && self.data[i].0 <= tail {
            let start = self.data[i].0;
            let held = self.data[i].1.len() as u32;
            let end = start + held;
            if end > head {
                if start > head && end < tail {
                    // Held run sits strictly inside the new one: drop it.
                    self.size -= held;
                    self.data.remove(i);
                    continue;
                }
                if start <= head {
                    head = end;
                }
                if end >= tail {
                    tail = start;
                }
            }
            i += 1;
        }

        if head >= tail {
            log::trace!("[rxbuf] nothing to store from {seq}+{}", payload.len());
            return false;
        }

        let from = (head - seq) as usize;
        let len = (tail - head) as usize;
        let bytes = payload[from..from + len].to_vec();
        let pos = self
            .data
            .iter()
            .position(|(start, _)| *start > head)
            .unwrap_or(self.data.len());
        self.data.insert(pos, (head, bytes));
        self.size += len as u32;

        if head > self.next_rx_seq {
            self.update_sack_list(head, tail);
        }

        // Advance over whatever is now contiguous.
        for (start, bytes) in &self.data {
            if *start > self.next_rx_seq {
                break;
            }
            let end = *start + bytes.len() as u32;
            if end > self.next_rx_seq {
                self.avail += end - self.next_rx_seq;
                self.next_rx_seq = end;
            }
        }
        self.clear_sack_list(self.next_rx_seq);

        if self.got_fin && self.next_rx_seq == self.fin_seq {
            self.next_rx_seq += 1;
        }
        log::trace!(
            "[rxbuf] stored [{head};{tail}), next_rx={} avail={}",
            self.next_rx_seq,
            self.avail
        );
        true
    }

    /// Take up to `max_size` in-order bytes.
    pub fn extract(&mut self, max_size: u32) -> Vec<u8> {
        let mut want = max_size.min(self.avail);
        let mut out = Vec::with_capacity(want as usize);
        while want > 0 {
            let (start, bytes) = self.data.remove(0);
            assert!(start <= self.next_rx_seq, "extracting past a hole at {start}");
            let len = bytes.len() as u32;
            if len <= want {
                out.extend_from_slice(&bytes);
                self.size -= len;
                self.avail -= len;
                want -= len;
            } else {
                out.extend_from_slice(&bytes[..want as usize]);
                self.data.insert(0, (start + want, bytes[want as usize..].to_vec()));
                self.size -= want;
                self.avail -= want;
                want = 0;
            }
        }
        out
    }

    /// Merge `[head, tail)` with adjacent blocks and put it first, as
    /// RFC 2018 requires for the block that triggered the ACK.
    fn update_sack_list(&mut self, head: SequenceNumber, tail: SequenceNumber) {
        let mut current = SackBlock::new(head, tail);
        let mut i = 0;
        while i < self.sack_list.len() {
            let found = self.sack_list[i];
            if found.left <= current.right && found.right >= current.left {
                current.left = current.left.min(found.left);
                current.right = current.right.max(found.right);
                self.sack_list.remove(i);
            } else {
                i += 1;
            }
        }
        self.sack_list.push_front(current);
    }

    /// Forget blocks that are now below `seq`.
    fn clear_sack_list(&mut self, seq: SequenceNumber) {
        self.sack_list.retain(|b| b.right > seq);
        for block in self.sack_list.iter_mut() {
            if block.left < seq {
                block.left = seq;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: u32) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    #[test]
    fn in_order_data_is_available() {
        let mut rx = RxBuffer::new(s(1));
        assert!(rx.add(s(1), b"hello"));
        assert_eq!(rx.next_rx_sequence(), s(6));
        assert_eq!(rx.available(), 5);
        assert_eq!(rx.extract(3), b"hel");
        assert_eq!(rx.extract(10), b"lo");
        assert_eq!(rx.size(), 0);
    }

    #[test]
    fn hole_is_filled_later() {
        let mut rx = RxBuffer::new(s(1));
        assert!(rx.add(s(11), &[2u8; 10]));
        assert_eq!(rx.available(), 0);
        assert_eq!(rx.sack_list().copied().collect::<Vec<_>>(), vec![SackBlock::new(s(11), s(21))]);

        assert!(rx.add(s(1), &[1u8; 10]));
        assert_eq!(rx.next_rx_sequence(), s(21));
        assert_eq!(rx.available(), 20);
        assert_eq!(rx.sack_list_len(), 0);
    }

    #[test]
    fn duplicate_and_overlap_are_trimmed() {
        let mut rx = RxBuffer::new(s(1));
        assert!(rx.add(s(1), b"abcd"));
        assert!(!rx.add(s(1), b"abcd"));
        assert!(rx.add(s(3), b"cdef"));
        assert_eq!(rx.size(), 6);
        assert_eq!(rx.extract(100), b"abcdef");
    }

    #[test]
    fn sack_blocks_merge_and_latest_first() {
        let mut rx = RxBuffer::new(s(1));
        rx.add(s(101), &[0u8; 50]);
        rx.add(s(201), &[0u8; 50]);
        rx.add(s(151), &[0u8; 50]);
        let blocks: Vec<_> = rx.sack_list().copied().collect();
        assert_eq!(blocks, vec![SackBlock::new(s(101), s(251))]);
        rx.add(s(301), &[0u8; 10]);
        assert_eq!(rx.sack_list().next(), Some(&SackBlock::new(s(301), s(311))));
    }

    #[test]
    fn window_edge_trims_tail() {
        let mut rx = RxBuffer::new(s(1));
        rx.set_max_buffer_size(8);
        assert!(rx.add(s(1), &[0u8; 20]));
        assert_eq!(rx.available(), 8);
        assert_eq!(rx.max_rx_sequence(), s(9));
        assert!(!rx.add(s(9), &[0u8; 4]));
    }

    #[test]
    fn fin_consumed_once_in_order() {
        let mut rx = RxBuffer::new(s(1));
        rx.set_fin_sequence(s(6));
        assert!(!rx.finished());
        rx.add(s(1), b"12345");
        assert_eq!(rx.next_rx_sequence(), s(7));
        assert!(rx.finished());
    }
}
