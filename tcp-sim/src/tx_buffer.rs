//! Transmit buffer and SACK scoreboard.
//!
//! [`TxBuffer`] holds every byte the application has handed over and the
//! peer has not yet acknowledged, split across two ordered lists:
//!
//! ```text
//!  head                    head + sent_size                      tail
//!   │◀──────── sent ─────────▶│◀────────────── unsent ───────────▶│
//!   │ [item][item][item]      │ [item]      [item]                │
//! ```
//!
//! Items are contiguous byte runs.  A request for `[seq, seq + n)` that does
//! not fall on item boundaries splits the item at the boundary; a request
//! spanning several items merges them first.  Either way the search restarts,
//! so [`TxBuffer::copy_from_sequence`] always ends on exactly one item of
//! exactly the requested size.
//!
//! The sent list doubles as the RFC 6675 scoreboard: every item carries
//! `sacked`, `lost` and `retrans` flags that drive [`TxBuffer::bytes_in_flight`]
//! and [`TxBuffer::next_seg`].

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::packet::SackBlock;
use crate::seq::SequenceNumber;
use crate::simulator::Clock;

/// Delivery-rate snapshot taken when an item is transmitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateInfo {
    /// Send time of the first item of the flight this one belongs to.
    pub first_sent: Duration,
    /// Bytes delivered (acked or SACKed) when this item was sent.
    pub delivered: u64,
    /// Time `delivered` was last advanced.
    pub delivered_time: Duration,
    /// The application had nothing more queued when this item was sent.
    pub app_limited: bool,
}

/// A contiguous run of application bytes owned by the buffer.
#[derive(Debug, Clone, Default)]
pub struct TxItem {
    pub data: Vec<u8>,
    /// Sent more than once.
    pub retrans: bool,
    /// Declared lost by a retransmission timeout or on entering recovery.
    pub lost: bool,
    /// Covered by a SACK block from the peer.
    pub sacked: bool,
    /// Time of the most recent transmission.
    pub last_sent: Option<Duration>,
    pub rate: RateInfo,
}

impl TxItem {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Detach the first `n` bytes into a new item carrying the same flags.
    fn split_front(&mut self, n: u32) -> TxItem {
        let tail = self.data.split_off(n as usize);
        let front = std::mem::replace(&mut self.data, tail);
        TxItem {
            data: front,
            retrans: self.retrans,
            lost: self.lost,
            sacked: self.sacked,
            last_sent: self.last_sent,
            rate: self.rate,
        }
    }

    /// Append `next` to `self`.  The merged item is retransmitted or lost if
    /// either part was, and SACKed only if both were.
    fn merge(&mut self, next: TxItem) {
        self.data.extend_from_slice(&next.data);
        self.retrans |= next.retrans;
        self.lost |= next.lost;
        self.sacked &= next.sacked;
        self.last_sent = match (self.last_sent, next.last_sent) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Send-side byte queue with scoreboard.
pub struct TxBuffer {
    /// Never sent (or sent and then declared lost).
    app_list: VecDeque<TxItem>,
    /// Sent at least once and not yet acknowledged.
    sent_list: VecDeque<TxItem>,
    first_byte_seq: SequenceNumber,
    size: u32,
    sent_size: u32,
    max_buffer: u32,
    /// Highest sequence ever handed out; re-sends below it are retransmissions.
    high_sent: SequenceNumber,
    /// `[start, end)` of the highest SACKed item.
    highest_sack: Option<(SequenceNumber, SequenceNumber)>,
    reno_sack: bool,
    delivered: u64,
    delivered_time: Duration,
    first_sent_time: Duration,
    clock: Clock,
}

impl TxBuffer {
    pub fn new(head: SequenceNumber) -> Self {
        Self {
            app_list: VecDeque::new(),
            sent_list: VecDeque::new(),
            first_byte_seq: head,
            size: 0,
            sent_size: 0,
            max_buffer: 32_768,
            high_sent: head,
            highest_sack: None,
            reno_sack: false,
            delivered: 0,
            delivered_time: Duration::ZERO,
            first_sent_time: Duration::ZERO,
            clock: Clock::default(),
        }
    }

    /// Use `clock` for transmission timestamps.
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// First unacknowledged byte (SND.UNA).
    pub fn head_sequence(&self) -> SequenceNumber {
        self.first_byte_seq
    }

    /// One past the last byte queued.
    pub fn tail_sequence(&self) -> SequenceNumber {
        self.first_byte_seq + self.size
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes in the sent list.
    pub fn sent_size(&self) -> u32 {
        self.sent_size
    }

    /// Bytes in the unsent list.
    pub fn unsent_size(&self) -> u32 {
        self.size - self.sent_size
    }

    pub fn max_buffer_size(&self) -> u32 {
        self.max_buffer
    }

    pub fn set_max_buffer_size(&mut self, n: u32) {
        self.max_buffer = n;
    }

    /// Free space left for [`TxBuffer::add`].
    pub fn available(&self) -> u32 {
        self.max_buffer.saturating_sub(self.size)
    }

    /// Rebase the buffer, e.g. once the ISN is known.
    ///
    /// # Panics
    ///
    /// Panics if anything has been sent from the current base.
    pub fn set_head_sequence(&mut self, seq: SequenceNumber) {
        assert!(
            self.sent_list.is_empty(),
            "cannot move the head of a buffer with {} bytes in the sent list",
            self.sent_size
        );
        self.first_byte_seq = seq;
        self.high_sent = seq;
    }

    /// Queue `data` for sending.  Returns `false` and leaves the buffer
    /// untouched when there is not enough room for all of it.
    pub fn add(&mut self, data: &[u8]) -> bool {
        log::trace!(
            "[txbuf] try to append {} bytes at {}, available={}",
            data.len(),
            self.tail_sequence(),
            self.available()
        );
        if data.len() as u64 > u64::from(self.available()) {
            log::warn!("[txbuf] rejected {} bytes: not enough room", data.len());
            return false;
        }
        if !data.is_empty() {
            self.app_list.push_back(TxItem::new(data.to_vec()));
            self.size += data.len() as u32;
        }
        true
    }

    /// Bytes from `seq` to the tail; 0 (with an error log) past the tail.
    pub fn size_from_sequence(&self, seq: SequenceNumber) -> u32 {
        let tail = self.tail_sequence();
        if tail >= seq {
            return tail - seq;
        }
        log::error!("[txbuf] requested {seq} beyond the tail {tail}; returning 0");
        0
    }

    /// Copy `min(max_bytes, size_from_sequence(seq))` bytes starting at `seq`.
    ///
    /// Bytes still in the unsent list move to the sent list; bytes already in
    /// the sent list are marked retransmitted.  Nothing is discarded.
    ///
    /// # Panics
    ///
    /// Panics if `seq` is below the head or if the request would leave a hole
    /// between the sent and unsent lists.
    pub fn copy_from_sequence(&mut self, max_bytes: u32, seq: SequenceNumber) -> Vec<u8> {
        assert!(
            seq >= self.first_byte_seq,
            "requested {seq}, which is below the buffer head {}",
            self.first_byte_seq
        );

        let s = max_bytes.min(self.size_from_sequence(seq));
        if s == 0 {
            return Vec::new();
        }

        let sent_end = self.first_byte_seq + self.sent_size;
        let idx = if sent_end >= seq + s {
            // Already sent completely.
            let idx = self.get_transmitted_segment(s, seq);
            self.sent_list[idx].retrans = true;
            log::trace!("[txbuf] retransmitting [{seq};{}|{s}]", seq + s);
            idx
        } else if sent_end <= seq {
            assert!(
                sent_end == seq,
                "requesting new data at {seq} with a hole after {sent_end}"
            );
            log::trace!("[txbuf] new segment [{seq};{}|{s}]", seq + s);
            self.get_new_segment(s)
        } else {
            // Partial: a prefix is a retransmission, the rest is new.
            let amount = (seq + s) - sent_end;
            self.get_new_segment(amount);
            let idx = self.get_transmitted_segment(s, seq);
            self.sent_list[idx].retrans = true;
            log::trace!("[txbuf] retransmitting [{seq};{}|{s}] with {amount} new", seq + s);
            idx
        };

        let now = self.clock.now();
        let app_limited = self.app_list.is_empty();
        let rate = RateInfo {
            first_sent: self.first_sent_time,
            delivered: self.delivered,
            delivered_time: self.delivered_time,
            app_limited,
        };
        let item = &mut self.sent_list[idx];
        item.last_sent = Some(now);
        item.rate = rate;
        assert_eq!(item.len(), s, "extracted item has the wrong size");
        self.high_sent = self.high_sent.max(seq + s);
        item.data.clone()
    }

    /// Move the first `num_bytes` of the unsent list to the end of the sent
    /// list and return its index there.
    fn get_new_segment(&mut self, num_bytes: u32) -> usize {
        if self.sent_list.is_empty() {
            // A new flight starts.
            let now = self.clock.now();
            self.first_sent_time = now;
            self.delivered_time = now;
        }
        let start = self.first_byte_seq + self.sent_size;
        let idx = get_item_from_list(&mut self.app_list, start, num_bytes, start);
        debug_assert_eq!(idx, 0);
        let Some(mut item) = self.app_list.remove(idx) else {
            unreachable!("index returned by the list walk is valid");
        };
        if start < self.high_sent {
            item.retrans = true;
        }
        self.sent_size += item.len();
        self.sent_list.push_back(item);
        self.sent_list.len() - 1
    }

    fn get_transmitted_segment(&mut self, num_bytes: u32, seq: SequenceNumber) -> usize {
        assert!(seq >= self.first_byte_seq);
        assert!(num_bytes <= self.sent_size);
        get_item_from_list(&mut self.sent_list, self.first_byte_seq, num_bytes, seq)
    }

    /// Acknowledge everything below `seq`.  A no-op if `seq` is not past
    /// the head, so repeating the call changes nothing.
    pub fn discard_up_to(&mut self, seq: SequenceNumber) {
        if self.first_byte_seq >= seq {
            log::trace!("[txbuf] {seq} already discarded");
            return;
        }

        let mut offset = seq - self.first_byte_seq;
        let mut newly_delivered: u64 = 0;
        while let Some(front) = self.sent_list.front_mut() {
            let len = front.len();
            if offset >= len {
                if !front.sacked {
                    newly_delivered += u64::from(len);
                }
                self.size -= len;
                self.sent_size -= len;
                offset -= len;
                self.first_byte_seq += len;
                self.sent_list.pop_front();
            } else if offset > 0 {
                if !front.sacked {
                    newly_delivered += u64::from(offset);
                }
                front.data.drain(..offset as usize);
                self.size -= offset;
                self.sent_size -= offset;
                self.first_byte_seq += offset;
                break;
            } else {
                break;
            }
        }

        // After a timeout the acknowledged bytes may be back in the unsent
        // list.
        if self.sent_list.is_empty() {
            while offset > 0 {
                let Some(front) = self.app_list.front_mut() else {
                    break;
                };
                let n = offset.min(front.len());
                newly_delivered += u64::from(n);
                if n == front.len() {
                    self.app_list.pop_front();
                } else {
                    front.data.drain(..n as usize);
                }
                self.size -= n;
                offset -= n;
                self.first_byte_seq += n;
            }
            self.high_sent = self.high_sent.max(self.first_byte_seq);
        }

        // Acknowledging a FIN moves the head past the last byte.
        if self.size == 0 {
            self.first_byte_seq = seq;
            self.high_sent = self.high_sent.max(seq);
        }
        if let Some((start, _)) = self.highest_sack {
            if start < self.first_byte_seq {
                self.highest_sack = None;
            }
        }
        if newly_delivered > 0 {
            self.delivered += newly_delivered;
            self.delivered_time = self.clock.now();
        }
        log::trace!("[txbuf] discarded up to {seq}: {self}");
    }

    // -----------------------------------------------------------------------
    // Scoreboard
    // -----------------------------------------------------------------------

    /// Build the SACK blocks a receiver would send for the current
    /// scoreboard, as if one more segment after the highest SACKed one (or
    /// after `ack_base` if nothing is SACKed) had just arrived.
    ///
    /// The new block comes first, then previously SACKed items from the
    /// highest down, one block per item, up to `max_blocks`.
    pub fn craft_sack_option(&self, ack_base: SequenceNumber, max_blocks: usize) -> Vec<SackBlock> {
        let mut blocks = Vec::new();
        if max_blocks == 0 {
            return blocks;
        }
        let after = self.highest_sack.map_or(ack_base, |(start, _)| start);

        let mut begin = self.first_byte_seq;
        for item in &self.sent_list {
            if begin > after && !item.sacked {
                blocks.push(SackBlock::new(begin, begin + item.len()));
                break;
            }
            begin += item.len();
        }

        let mut end = self.first_byte_seq + self.sent_size;
        for item in self.sent_list.iter().rev() {
            let start = end - item.len();
            if blocks.len() >= max_blocks {
                break;
            }
            if item.sacked {
                blocks.push(SackBlock::new(start, end));
            }
            end = start;
        }
        blocks
    }

    /// Mark every sent item fully covered by one of `blocks` as SACKed.
    /// Returns `true` if anything new was learned.
    pub fn update(&mut self, blocks: &[SackBlock]) -> bool {
        let mut modified = false;
        let now = self.clock.now();
        for block in blocks {
            let mut begin = self.first_byte_seq;
            for item in self.sent_list.iter_mut() {
                let end = begin + item.len();
                if begin >= block.left && end <= block.right && !item.sacked {
                    item.sacked = true;
                    modified = true;
                    self.delivered += u64::from(item.len());
                    self.delivered_time = now;
                    let higher = self.highest_sack.map_or(true, |(start, _)| begin > start);
                    if higher {
                        self.highest_sack = Some((begin, end));
                    }
                }
                begin = end;
            }
        }
        if modified {
            log::trace!("[txbuf] scoreboard updated, highest sack {:?}", self.highest_sack);
        }
        modified
    }

    /// Declare everything in flight lost: move the sent list back in front
    /// of the unsent list with SACK state cleared.
    pub fn reset_sent_list(&mut self) {
        while let Some(mut item) = self.sent_list.pop_back() {
            item.sacked = false;
            item.lost = true;
            item.retrans = false;
            self.app_list.push_front(item);
        }
        self.sent_size = 0;
        self.highest_sack = None;
        self.reno_sack = false;
        log::debug!("[txbuf] sent list reset: {self}");
    }

    pub fn is_head_retransmitted(&self) -> bool {
        self.sent_list.front().is_some_and(|i| i.retrans)
    }

    /// RFC 6675 IsLost for the item containing `seq`.
    pub fn is_lost(&self, seq: SequenceNumber, dup_thresh: u32, seg_size: u32) -> bool {
        let mut begin = self.first_byte_seq;
        let mut idx = None;
        for (i, item) in self.sent_list.iter().enumerate() {
            if seq >= begin && seq < begin + item.len() {
                idx = Some(i);
                break;
            }
            begin += item.len();
        }
        let Some(idx) = idx else {
            return false;
        };
        let item = &self.sent_list[idx];
        if item.lost {
            return true;
        }
        let (count, bytes) = self
            .sent_list
            .iter()
            .skip(idx + 1)
            .filter(|i| i.sacked)
            .fold((0u32, 0u32), |(c, b), i| (c + 1, b + i.len()));
        count >= dup_thresh || bytes > dup_thresh.saturating_sub(1) * seg_size
    }

    /// Per-item loss verdicts for the sent list, computed in one backward
    /// pass over the SACKed items above each one.
    fn lost_flags(&self, dup_thresh: u32, seg_size: u32) -> Vec<bool> {
        let lost_bytes = dup_thresh.saturating_sub(1) * seg_size;
        let mut sacked_count = 0u32;
        let mut sacked_bytes = 0u32;
        let mut flags = vec![false; self.sent_list.len()];
        for (i, item) in self.sent_list.iter().enumerate().rev() {
            if item.sacked {
                sacked_count += 1;
                sacked_bytes += item.len();
                continue;
            }
            flags[i] = item.lost || sacked_count >= dup_thresh || sacked_bytes > lost_bytes;
        }
        flags
    }

    /// RFC 6675 "pipe": bytes believed to be in the network.
    pub fn bytes_in_flight(&self, dup_thresh: u32, seg_size: u32) -> u32 {
        let lost = self.lost_flags(dup_thresh, seg_size);
        self.sent_list
            .iter()
            .zip(lost)
            .filter(|(item, _)| !item.sacked)
            .map(|(item, lost)| {
                let original = if lost { 0 } else { item.len() };
                let retransmitted = if item.retrans { item.len() } else { 0 };
                original + retransmitted
            })
            .sum()
    }

    /// RFC 6675 NextSeg: the next sequence worth sending, if any.
    ///
    /// 1. the first lost, not yet retransmitted item;
    /// 2. the first unsent byte;
    /// 3. (`rule3`) the first un-SACKed, un-retransmitted item below the
    ///    highest SACK.
    pub fn next_seg(&self, dup_thresh: u32, seg_size: u32, rule3: bool) -> Option<SequenceNumber> {
        let lost = self.lost_flags(dup_thresh, seg_size);
        let mut begin = self.first_byte_seq;
        for (item, lost) in self.sent_list.iter().zip(&lost) {
            if *lost && !item.sacked && !item.retrans {
                return Some(begin);
            }
            begin += item.len();
        }

        if self.unsent_size() > 0 {
            return Some(self.first_byte_seq + self.sent_size);
        }

        if rule3 {
            if let Some((highest, _)) = self.highest_sack {
                let mut begin = self.first_byte_seq;
                for item in &self.sent_list {
                    if begin >= highest {
                        break;
                    }
                    if !item.sacked && !item.retrans {
                        return Some(begin);
                    }
                    begin += item.len();
                }
            }
        }
        None
    }

    /// Emulate a SACK for one more segment after the head, for peers that do
    /// not support SACK (RFC 6582 duplicate-ACK accounting).
    pub fn add_reno_sack(&mut self) {
        if self.sent_list.len() <= 1 {
            return;
        }
        self.reno_sack = true;
        let mut begin = self.first_byte_seq + self.sent_list[0].len();
        for item in self.sent_list.iter_mut().skip(1) {
            let end = begin + item.len();
            if !item.sacked {
                item.sacked = true;
                self.highest_sack = Some((begin, end));
                return;
            }
            begin = end;
        }
    }

    /// Mark the first sent item lost so the pipe stops counting it.
    pub fn mark_head_as_lost(&mut self) {
        if let Some(head) = self.sent_list.front_mut() {
            head.lost = true;
        }
    }

    /// Undo every emulated SACK.
    pub fn reset_reno_sack(&mut self) {
        if !self.reno_sack {
            return;
        }
        for item in self.sent_list.iter_mut() {
            item.sacked = false;
        }
        self.highest_sack = None;
        self.reno_sack = false;
    }

    /// Total bytes cumulatively acked or SACKed.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// The sent-list item starting exactly at `seq`, if any.
    pub fn sent_item_at(&self, seq: SequenceNumber) -> Option<&TxItem> {
        let mut begin = self.first_byte_seq;
        for item in &self.sent_list {
            if begin == seq {
                return Some(item);
            }
            begin += item.len();
        }
        None
    }
}

/// Find (creating it by split or merge if needed) the item of `list` that
/// starts at `seq` and is exactly `num_bytes` long.  `list_start` is the
/// sequence number of the first byte of `list`.
fn get_item_from_list(
    list: &mut VecDeque<TxItem>,
    list_start: SequenceNumber,
    num_bytes: u32,
    seq: SequenceNumber,
) -> usize {
    loop {
        let mut begin = list_start;
        let mut idx = 0;
        loop {
            assert!(idx < list.len(), "sequence {seq} is not in the list starting at {list_start}");
            let len = list[idx].len();
            if seq < begin + len {
                break;
            }
            begin += len;
            idx += 1;
        }

        if seq != begin {
            // seq is inside the item: split off the part before it and retry.
            let front = list[idx].split_front(seq - begin);
            list.insert(idx, front);
            continue;
        }

        let len = list[idx].len();
        if num_bytes == len {
            return idx;
        }
        if num_bytes < len {
            let front = list[idx].split_front(num_bytes);
            list.insert(idx, front);
            return idx;
        }

        // The request runs past this item: merge with the next one and retry.
        assert!(
            idx + 1 < list.len(),
            "cannot extract {num_bytes} bytes at {seq}: list ends first"
        );
        let Some(next) = list.remove(idx + 1) else {
            unreachable!("bounds checked above");
        };
        list[idx].merge(next);
    }
}

impl fmt::Display for TxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sent list: ")?;
        let mut begin = self.first_byte_seq;
        for item in &self.sent_list {
            write!(f, "[{};{}|{}|", begin, begin + item.len(), item.len())?;
            if item.sacked {
                write!(f, "S")?;
            }
            if item.retrans {
                write!(f, "R")?;
            }
            if item.lost {
                write!(f, "L")?;
            }
            write!(f, "]")?;
            begin += item.len();
        }
        write!(
            f,
            ", size = {} Total size: {} head = {} sent = {}",
            self.sent_list.len(),
            self.size,
            self.first_byte_seq,
            self.sent_size
        )
    }
}

impl fmt::Debug for TxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: u32) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    fn sent_lens(buf: &TxBuffer) -> Vec<u32> {
        buf.sent_list.iter().map(TxItem::len).collect()
    }

    #[test]
    fn split_on_unaligned_start() {
        let mut buf = TxBuffer::new(s(1));
        buf.set_max_buffer_size(1000);
        assert!(buf.add(&[7u8; 300]));
        assert_eq!(buf.copy_from_sequence(300, s(1)).len(), 300);
        // Retransmit from the middle: splits [1;301) into [1;101) + [101;201) + [201;301).
        assert_eq!(buf.copy_from_sequence(100, s(101)).len(), 100);
        assert_eq!(sent_lens(&buf), vec![100, 100, 100]);
        assert!(buf.sent_list[1].retrans);
        assert!(!buf.sent_list[0].retrans);
    }

    #[test]
    fn merge_when_spanning_items() {
        let mut buf = TxBuffer::new(s(1));
        buf.set_max_buffer_size(1000);
        for _ in 0..3 {
            assert!(buf.add(&[1u8; 100]));
        }
        for i in 0..3 {
            buf.copy_from_sequence(100, s(1 + 100 * i));
        }
        assert_eq!(sent_lens(&buf), vec![100, 100, 100]);
        assert_eq!(buf.copy_from_sequence(250, s(1)).len(), 250);
        assert_eq!(sent_lens(&buf), vec![250, 50]);
    }

    #[test]
    fn mixed_retransmission_and_new_data() {
        let mut buf = TxBuffer::new(s(1));
        buf.set_max_buffer_size(1000);
        assert!(buf.add(&[9u8; 200]));
        buf.copy_from_sequence(100, s(1));
        assert_eq!(buf.copy_from_sequence(150, s(51)).len(), 150);
        assert_eq!(buf.sent_size(), 200);
        assert_eq!(buf.unsent_size(), 0);
    }

    #[test]
    #[should_panic(expected = "below the buffer head")]
    fn copy_below_head_panics() {
        let mut buf = TxBuffer::new(s(100));
        buf.add(&[0u8; 10]);
        buf.copy_from_sequence(5, s(50));
    }

    #[test]
    #[should_panic(expected = "hole")]
    fn copy_with_hole_panics() {
        let mut buf = TxBuffer::new(s(1));
        buf.add(&[0u8; 100]);
        buf.copy_from_sequence(10, s(50));
    }

    #[test]
    fn add_rejects_when_full() {
        let mut buf = TxBuffer::new(s(0));
        buf.set_max_buffer_size(10);
        assert!(buf.add(&[0u8; 8]));
        assert!(!buf.add(&[0u8; 3]));
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.available(), 2);
    }

    #[test]
    fn reno_sack_marks_after_head() {
        let mut buf = TxBuffer::new(s(1));
        buf.set_max_buffer_size(1000);
        buf.add(&[0u8; 400]);
        for i in 0..4 {
            buf.copy_from_sequence(100, s(1 + 100 * i));
        }
        assert_eq!(buf.bytes_in_flight(3, 100), 400);
        buf.add_reno_sack();
        buf.add_reno_sack();
        buf.add_reno_sack();
        assert!(buf.is_lost(s(1), 3, 100));
        // Head lost, three SACKed: nothing in flight.
        assert_eq!(buf.bytes_in_flight(3, 100), 0);
        assert_eq!(buf.next_seg(3, 100, false), Some(s(1)));
        buf.reset_reno_sack();
        assert_eq!(buf.bytes_in_flight(3, 100), 400);
    }

    #[test]
    fn discard_tracks_delivered_bytes() {
        let mut buf = TxBuffer::new(s(1));
        buf.add(&[0u8; 300]);
        buf.copy_from_sequence(300, s(1));
        buf.discard_up_to(s(151));
        assert_eq!(buf.delivered(), 150);
        buf.discard_up_to(s(151));
        assert_eq!(buf.delivered(), 150);
    }
}
