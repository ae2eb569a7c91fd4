//! Receive path of [`Connection`].
//!
//! Every segment goes through the same three steps:
//!
//! 1. drop payload that falls outside the receive window;
//! 2. process options (handshake negotiation, timestamps, RTT, window);
//! 3. hand the segment to the handler for the current state.
//!
//! | State                              | Handler              |
//! |------------------------------------|----------------------|
//! | LISTEN                             | fork request         |
//! | SYN_SENT                           | `process_syn_sent`   |
//! | SYN_RCVD                           | `process_syn_rcvd`   |
//! | ESTABLISHED                        | `process_established`|
//! | FIN_WAIT_1, FIN_WAIT_2, CLOSE_WAIT | `process_wait`       |
//! | CLOSING                            | `process_closing`    |
//! | LAST_ACK                           | `process_last_ack`   |
//! | TIME_WAIT                          | ignored              |
//! | CLOSED                             | RST reply            |
//!
//! The second half of the file is the ACK clock: duplicate-ACK counting, fast
//! retransmit and recovery, and the hand-off to the congestion controller.

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::{cancel, is_pending, Connection};
use crate::implementation::{Notification, TcpImplementation, Timer};
use crate::packet::{flags, option_kind, Segment, TcpHeader, TcpOption};
use crate::seq::SequenceNumber;
use crate::state::{CongState, TcpState};

/// Flags that never change how a segment is processed.
const IGNORED_FLAGS: u8 = flags::PSH | flags::URG;

impl Connection {
    pub(crate) fn forward_up(&mut self, segment: Segment, from: SocketAddr, to: SocketAddr) {
        self.traces.rx.fire(&segment.header, &segment.payload, self.id);

        let state = self.tcp_state();
        let h = &segment.header;
        let len = segment.payload.len() as u32;
        log::trace!("[tcp {}] <- {h} len={len} in {state}", self.id);

        if len > 0 && self.out_of_range(h.seq, h.seq + len) {
            log::debug!(
                "[tcp {}] dropping out-of-window segment {}..{} (next_rx {})",
                self.id,
                h.seq,
                h.seq + len,
                self.rx_buffer.next_rx_sequence()
            );
            if state == TcpState::Established && !h.has_flag(flags::RST) {
                self.send_empty_packet(flags::ACK);
            }
            return;
        }

        if state == TcpState::Listen {
            self.process_listen(segment, from, to);
            return;
        }

        if !h.has_flag(flags::RST) && !self.process_options(h) {
            return;
        }

        if self.rwnd() == 0 && self.connected && !is_pending(&self.timers.persist) {
            self.start_persist();
        }

        match state {
            TcpState::Listen => {}
            TcpState::SynSent => self.process_syn_sent(&segment),
            TcpState::SynRcvd => self.process_syn_rcvd(&segment, from),
            TcpState::Established => self.process_established(&segment),
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait => {
                self.process_wait(&segment)
            }
            TcpState::Closing => self.process_closing(&segment),
            TcpState::LastAck => self.process_last_ack(&segment),
            TcpState::TimeWait => {}
            TcpState::Closed => self.reply_rst(&segment.header, from, to),
        }

        if self.rwnd() != 0 && is_pending(&self.timers.persist) {
            log::debug!("[tcp {}] window reopened to {}", self.id, self.rwnd());
            cancel(&mut self.timers.persist);
            self.persist_timeout = self.config.persist_timeout;
            let connected = self.connected;
            self.send_pending_data(connected);
        }
    }

    /// Whether `[head, tail)` lies entirely outside what we can accept.
    fn out_of_range(&self, head: SequenceNumber, tail: SequenceNumber) -> bool {
        let next_rx = self.rx_buffer.next_rx_sequence();
        match self.tcp_state() {
            TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd => false,
            // Only an exact retransmission is expected once the peer closed.
            TcpState::LastAck | TcpState::Closing | TcpState::CloseWait => head != next_rx,
            _ => tail < next_rx || self.rx_buffer.max_rx_sequence() <= head,
        }
    }

    // -----------------------------------------------------------------------
    // Options, RTT and window
    // -----------------------------------------------------------------------

    /// Returns `false` if the segment must be discarded.
    fn process_options(&mut self, h: &TcpHeader) -> bool {
        if h.has_flag(flags::SYN) {
            if !matches!(self.tcp_state(), TcpState::SynSent | TcpState::SynRcvd) {
                return true;
            }
            // The window on a SYN is never scaled.
            self.traces.rwnd.set(u32::from(h.window));
            self.process_syn_options(h);
            self.tcb.reset_window();
            if h.has_flag(flags::ACK) {
                self.estimate_rtt(h);
                self.traces.high_rx_ack.set(h.ack);
            }
            return true;
        }

        if h.has_flag(flags::ACK) {
            if self.timestamp {
                match h.option(option_kind::TIMESTAMP) {
                    Some(TcpOption::Timestamp { value, .. }) => {
                        if h.seq <= self.high_tx_ack {
                            self.timestamp_to_echo = *value;
                        }
                    }
                    _ => {
                        log::debug!("[tcp {}] timestamp missing, discarding {h}", self.id);
                        return false;
                    }
                }
            }
            self.estimate_rtt(h);
            self.update_window_size(h);
        }
        true
    }

    fn estimate_rtt(&mut self, h: &TcpHeader) {
        let now = self.sim.now();
        let advances = h.ack > self.tx_buffer.head_sequence() || h.has_flag(flags::SYN);
        let mut sample = self.history.sample(h.ack, now);

        if self.timestamp && advances {
            if let Some(TcpOption::Timestamp { echo, .. }) = h.option(option_kind::TIMESTAMP) {
                let ms = self.now_ms().wrapping_sub(*echo);
                if ms > 0 {
                    sample = Some(Duration::from_millis(u64::from(ms)));
                }
            }
        }

        let Some(rtt) = sample.filter(|d| !d.is_zero()) else {
            return;
        };
        self.rtt.measurement(rtt);
        let rto = self.compute_rto();
        self.traces.rto.set(rto);
        self.traces.last_rtt.set(rtt);
        log::trace!(
            "[tcp {}] rtt sample {rtt:?}, srtt {:?}, rto {rto:?}",
            self.id,
            self.rtt.estimate()
        );
    }

    /// RFC 793 window update rule, applied to the scaled window.
    fn update_window_size(&mut self, h: &TcpHeader) {
        let win = u32::from(h.window) << self.snd_wind_shift;
        if self.tcp_state() < TcpState::Established {
            self.traces.rwnd.set(win);
            return;
        }

        let high_rx_ack = self.traces.high_rx_ack.get();
        let mut update = false;
        if h.ack == high_rx_ack && win > self.rwnd() {
            update = true;
        }
        if h.ack > high_rx_ack {
            self.traces.high_rx_ack.set(h.ack);
            update = true;
        }
        if h.seq > self.traces.high_rx.get() {
            self.traces.high_rx.set(h.seq);
            update = true;
        }
        if update {
            self.traces.rwnd.set(win);
        }
    }

    // -----------------------------------------------------------------------
    // Per-state handlers
    // -----------------------------------------------------------------------

    fn process_listen(&mut self, segment: Segment, from: SocketAddr, to: SocketAddr) {
        let f = segment.header.flags & !IGNORED_FLAGS;
        if f != flags::SYN {
            log::trace!("[tcp {}] LISTEN ignores [{}]", self.id, flags::describe(f));
            return;
        }
        log::debug!("[tcp {}] SYN from {from}, requesting fork", self.id);
        self.notify(Notification::ForkRequest { segment, from, to });
    }

    /// A CLOSED socket still attached to an endpoint refuses everything.
    fn reply_rst(&mut self, h: &TcpHeader, from: SocketAddr, to: SocketAddr) {
        if h.has_flag(flags::RST) {
            return;
        }
        let header = TcpHeader {
            source_port: h.destination_port,
            destination_port: h.source_port,
            seq: self.next_tx(),
            ack: self.rx_buffer.next_rx_sequence(),
            flags: flags::RST | flags::ACK,
            ..TcpHeader::default()
        };
        self.traces.tx.fire(&header, &[], self.id);
        self.l4.send_packet(Segment::new(header, Vec::new()), to, from);
    }

    fn process_syn_sent(&mut self, segment: &Segment) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;

        if f & flags::RST != 0 {
            log::info!("[tcp {}] connection refused", self.id);
            self.connection_failed();
            return;
        }

        match f {
            0 => {
                // Bare data: the peer already considers us connected.
                self.rx_buffer.set_next_rx_sequence(h.seq);
                self.establish_active();
                self.received_data(segment);
            }
            flags::ACK => {}
            flags::SYN => {
                log::debug!("[tcp {}] simultaneous open", self.id);
                self.set_state(TcpState::SynRcvd);
                self.rx_buffer.set_next_rx_sequence(h.seq + 1);
                self.traces.high_rx.set(h.seq);
                self.send_empty_packet(flags::SYN | flags::ACK);
            }
            f if f == flags::SYN | flags::ACK && h.ack == self.next_tx() + 1 => {
                self.rx_buffer.set_next_rx_sequence(h.seq + 1);
                self.traces.high_rx.set(h.seq);
                self.establish_active();
            }
            _ => {
                log::debug!("[tcp {}] unexpected [{}] in SYN_SENT", self.id, flags::describe(f));
                self.send_rst();
            }
        }
    }

    fn establish_active(&mut self) {
        self.set_state(TcpState::Established);
        self.connected = true;
        cancel(&mut self.timers.retransmit);
        let first = self.next_tx() + 1;
        self.set_next_tx(first);
        self.set_high_tx(first);
        self.recover = first;
        self.tx_buffer.set_head_sequence(first);
        self.send_empty_packet(flags::ACK);
        self.notify(Notification::ConnectionSucceeded);
        self.send_pending_data(true);
        // Acknowledge the first data segment at once.
        self.del_ack_count = self.config.del_ack_max_count;
    }

    fn establish_passive(&mut self, from: SocketAddr) {
        self.set_state(TcpState::Established);
        self.connected = true;
        cancel(&mut self.timers.retransmit);
        let first = self.next_tx() + 1;
        self.set_next_tx(first);
        self.set_high_tx(first);
        self.recover = first;
        self.tx_buffer.set_head_sequence(first);
        self.del_ack_count = self.config.del_ack_max_count;
        self.notify(Notification::NewConnectionCreated { from });
    }

    fn process_syn_rcvd(&mut self, segment: &Segment, from: SocketAddr) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;

        if f == 0 || (f == flags::ACK && h.ack == self.next_tx() + 1) {
            self.establish_passive(from);
            if f == flags::ACK {
                self.received_ack(segment);
            } else if !segment.payload.is_empty() {
                self.received_data(segment);
            }
            let space = self.tx_buffer.available();
            if space > 0 {
                self.notify(Notification::SendSpace(space));
            }
        } else if f == flags::SYN {
            // Our SYN-ACK was lost.
            self.rx_buffer.set_next_rx_sequence(h.seq + 1);
            self.send_empty_packet(flags::SYN | flags::ACK);
        } else if f == flags::FIN | flags::ACK
            && h.seq == self.rx_buffer.next_rx_sequence()
            && h.ack == self.next_tx() + 1
        {
            self.establish_passive(from);
            self.peer_close(segment);
        } else if f & flags::RST != 0 {
            self.peer_reset();
        } else {
            self.send_rst();
        }
    }

    fn process_established(&mut self, segment: &Segment) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;

        match f {
            flags::ACK => {
                if h.ack < self.tx_buffer.head_sequence() {
                    log::trace!("[tcp {}] stale ACK {}", self.id, h.ack);
                    return;
                }
                if h.ack > self.high_tx() {
                    log::debug!("[tcp {}] ACK {} beyond anything sent", self.id, h.ack);
                    self.send_empty_packet(flags::ACK);
                    return;
                }
                self.received_ack(segment);
            }
            flags::SYN => {}
            f if f == flags::SYN | flags::ACK => self.send_empty_packet(flags::ACK),
            f if f == flags::FIN || f == flags::FIN | flags::ACK => {
                if f & flags::ACK != 0 && h.ack > self.tx_buffer.head_sequence() {
                    self.acknowledge(h, 0);
                }
                self.peer_close(segment);
            }
            0 => {
                self.received_data(segment);
                if self.rx_buffer.finished() {
                    self.peer_close(segment);
                }
            }
            f if f & flags::RST != 0 => self.peer_reset(),
            _ => {
                log::debug!("[tcp {}] illegal flags [{}]", self.id, flags::describe(f));
                self.send_rst();
            }
        }
    }

    /// FIN_WAIT_1, FIN_WAIT_2 and CLOSE_WAIT.
    fn process_wait(&mut self, segment: &Segment) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;
        let len = segment.payload.len() as u32;

        if f == 0 {
            if len > 0 {
                self.received_data(segment);
            }
        } else if f == flags::ACK {
            self.received_ack(segment);
            if self.tcp_state() == TcpState::FinWait1
                && self.tx_buffer.size() == 0
                && h.ack == self.high_tx() + 1
            {
                self.set_state(TcpState::FinWait2);
                cancel(&mut self.timers.retransmit);
            }
        } else if f == flags::FIN || f == flags::FIN | flags::ACK {
            if f & flags::ACK != 0 {
                self.acknowledge(h, len);
            }
            self.rx_buffer.set_fin_sequence(h.seq + len);
            if len > 0 {
                self.received_data(segment);
            }
        } else if f & flags::SYN != 0 {
            return;
        } else if f & flags::RST != 0 {
            self.peer_reset();
            return;
        } else {
            self.send_rst();
            return;
        }

        let state = self.tcp_state();
        if matches!(state, TcpState::FinWait1 | TcpState::FinWait2) && self.rx_buffer.finished() {
            if state == TcpState::FinWait1 {
                let fin_acked = self.tx_buffer.size() == 0
                    && self.traces.high_rx_ack.get() == self.high_tx() + 1;
                if fin_acked {
                    self.time_wait();
                } else {
                    self.set_state(TcpState::Closing);
                }
            } else {
                self.time_wait();
            }
            self.send_empty_packet(flags::ACK);
            if !self.shutdown_recv {
                self.notify(Notification::DataReceived);
            }
        }
    }

    fn process_closing(&mut self, segment: &Segment) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;

        if f == flags::ACK {
            if h.ack == self.high_tx() + 1 {
                self.time_wait();
            }
        } else if f == flags::FIN || f == flags::FIN | flags::ACK {
            // The peer did not see our ACK of its FIN.
            self.send_empty_packet(flags::ACK);
        } else if f & flags::RST != 0 {
            self.peer_reset();
        } else {
            self.send_rst();
        }
    }

    fn process_last_ack(&mut self, segment: &Segment) {
        let h = &segment.header;
        let f = h.flags & !IGNORED_FLAGS;

        if f == 0 {
            if !segment.payload.is_empty() {
                self.received_data(segment);
            }
        } else if f == flags::ACK {
            self.received_ack(segment);
            if self.tx_buffer.size() == 0 && h.ack == self.high_tx() + 1 {
                self.close_and_notify();
            }
        } else if f == flags::FIN {
            self.send_empty_packet(flags::FIN | flags::ACK);
        } else if f == flags::FIN | flags::ACK {
            self.close_and_notify();
        } else if f & flags::RST != 0 {
            self.peer_reset();
        } else {
            self.send_rst();
        }
    }

    /// The peer aborted the connection.
    fn peer_reset(&mut self) {
        log::info!("[tcp {}] reset by peer in {}", self.id, self.tcp_state());
        self.abort();
    }

    // -----------------------------------------------------------------------
    // ACK processing
    // -----------------------------------------------------------------------

    pub(crate) fn received_ack(&mut self, segment: &Segment) {
        let len = segment.payload.len() as u32;
        self.acknowledge(&segment.header, len);
        if len > 0 {
            self.received_data(segment);
        }
        if !self.tcp_state().is_synchronized() || self.endpoint.is_none() {
            return;
        }
        self.maybe_send_deferred_fin();
        let connected = self.connected;
        self.send_pending_data(connected);
    }

    /// Scoreboard update, cumulative discard and the congestion response.
    fn acknowledge(&mut self, h: &TcpHeader, payload_len: u32) {
        let mut scoreboard_updated = false;
        if self.sack {
            if let Some(TcpOption::Sack(blocks)) = h.option(option_kind::SACK) {
                scoreboard_updated = self.tx_buffer.update(blocks);
            }
        }

        // The ACK of our FIN covers one sequence number past the data.
        let high_tx = self.high_tx();
        let ack = if h.ack > high_tx { high_tx } else { h.ack };
        let old_head = self.tx_buffer.head_sequence();
        if ack > old_head {
            self.tx_buffer.discard_up_to(ack);
        }
        self.process_ack(ack, old_head, scoreboard_updated, payload_len == 0);
    }

    fn process_ack(
        &mut self,
        ack: SequenceNumber,
        old_head: SequenceNumber,
        scoreboard_updated: bool,
        no_payload: bool,
    ) {
        self.tcb.last_acked_seq = ack;
        let seg = self.tcb.segment_size;
        let high_tx = self.high_tx();
        let last_rtt = self.traces.last_rtt.get();

        let is_dupack = if self.sack {
            scoreboard_updated
        } else {
            ack == old_head && ack < high_tx && no_payload
        };
        let old_dup_acks = self.dup_ack_count;

        if is_dupack {
            self.dup_ack();
        }

        if ack == old_head && ack == high_tx {
            return;
        }
        if ack == old_head {
            // A duplicate still means one segment left the network.
            self.cong.pkts_acked(&mut self.tcb, 1, last_rtt);
            return;
        }
        if ack < old_head {
            return;
        }

        let bytes_acked = ack - old_head;
        let mut segs = bytes_acked / seg;
        self.bytes_acked_not_processed += bytes_acked % seg;
        if self.bytes_acked_not_processed >= seg {
            segs += 1;
            self.bytes_acked_not_processed -= seg;
        }
        if !is_dupack {
            self.dup_ack_count = 0;
        }
        log::trace!(
            "[tcp {}] ACK {ack}: {bytes_acked} bytes, {segs} segment(s) in {}",
            self.id,
            self.tcb.cong_state
        );

        match self.tcb.cong_state {
            CongState::Recovery if ack < self.recover => {
                let mut cwnd = self.tcb.cwnd().saturating_sub(bytes_acked);
                if segs >= 1 {
                    cwnd += seg;
                }
                self.tcb.set_cwnd(cwnd.max(seg));
                if !self.sack {
                    self.tx_buffer.reset_reno_sack();
                }
                log::debug!("[tcp {}] partial ACK {ack}, recover {}", self.id, self.recover);
                self.retransmit_head();
                self.cong.pkts_acked(&mut self.tcb, 1, last_rtt);
                let reset_rto = self.first_partial_ack;
                self.first_partial_ack = false;
                self.new_ack(ack, reset_rto);
                return;
            }
            CongState::Loss if ack < self.recover => {
                self.cong.pkts_acked(&mut self.tcb, segs, last_rtt);
                self.cong.increase_window(&mut self.tcb, segs);
                self.new_ack(ack, true);
                return;
            }
            CongState::Open => {
                self.cong.pkts_acked(&mut self.tcb, segs, last_rtt);
            }
            CongState::Disorder => {
                if segs >= old_dup_acks {
                    segs -= old_dup_acks;
                    self.cong.pkts_acked(&mut self.tcb, segs, last_rtt);
                }
                if !is_dupack {
                    self.tx_buffer.reset_reno_sack();
                    self.set_cong_state(CongState::Open);
                }
            }
            CongState::Recovery => {
                self.first_partial_ack = true;
                segs = (ack - self.recover) / seg;
                self.cong.pkts_acked(&mut self.tcb, segs, last_rtt);
                let pipe = self.bytes_in_flight();
                let cwnd = self.tcb.ssthresh().min(pipe + seg);
                self.tcb.set_cwnd(cwnd);
                self.set_cong_state(CongState::Open);
                self.dup_ack_count = 0;
                self.tx_buffer.reset_reno_sack();
                log::debug!(
                    "[tcp {}] recovery complete at {ack}, cwnd {cwnd}",
                    self.id
                );
            }
            CongState::Loss => {
                self.first_partial_ack = true;
                segs = (ack - self.recover) / seg;
                self.cong.pkts_acked(&mut self.tcb, segs, last_rtt);
                self.set_cong_state(CongState::Open);
                self.tx_buffer.reset_reno_sack();
                log::debug!("[tcp {}] loss recovery complete at {ack}", self.id);
            }
            CongState::Cwr => {}
        }

        if self.tcb.cong_state == CongState::Open {
            self.cong.increase_window(&mut self.tcb, segs);
        }
        self.new_ack(ack, true);
    }

    fn dup_ack(&mut self) {
        if self.tcb.cong_state != CongState::Recovery {
            self.dup_ack_count += 1;
        }
        if self.tcb.cong_state == CongState::Open {
            log::debug!("[tcp {}] first duplicate ACK, entering DISORDER", self.id);
            self.set_cong_state(CongState::Disorder);
        }

        match self.tcb.cong_state {
            CongState::Recovery => {
                if !self.sack {
                    self.tx_buffer.add_reno_sack();
                }
            }
            CongState::Disorder => {
                let head = self.tx_buffer.head_sequence();
                if self.dup_ack_count == self.config.retx_thresh
                    && self.traces.high_rx_ack.get() >= self.recover
                {
                    self.enter_recovery();
                } else if self.tx_buffer.is_lost(head, self.config.retx_thresh, self.tcb.segment_size)
                {
                    self.enter_recovery();
                } else if !self.sack && self.config.limited_transmit {
                    // RFC 3042: let one new segment out per duplicate.
                    self.tx_buffer.add_reno_sack();
                }
            }
            _ => {}
        }
    }

    fn enter_recovery(&mut self) {
        let seg = self.tcb.segment_size;
        if self.sack {
            let head = self.tx_buffer.head_sequence();
            if !self.tx_buffer.is_lost(head, self.config.retx_thresh, seg) {
                self.tx_buffer.mark_head_as_lost();
            }
        } else {
            self.tx_buffer.add_reno_sack();
            self.tx_buffer.mark_head_as_lost();
        }

        self.recover = self.high_tx();
        self.set_cong_state(CongState::Recovery);

        let mut in_flight = self.bytes_in_flight();
        if !self.sack {
            in_flight += seg;
        }
        let ssthresh = self.cong.get_ssthresh(&self.tcb, in_flight);
        self.tcb.set_ssthresh(ssthresh);
        self.tcb.set_cwnd(ssthresh);
        log::debug!(
            "[tcp {}] {} dupacks, fast recovery: ssthresh {ssthresh}, recover {}",
            self.id,
            self.dup_ack_count,
            self.recover
        );
        self.retransmit_head();
    }

    fn new_ack(&mut self, ack: SequenceNumber, reset_rto: bool) {
        self.data_retr_count = self.config.data_retries;

        if self.tcp_state() != TcpState::SynRcvd && reset_rto {
            cancel(&mut self.timers.retransmit);
            let rto = self.compute_rto();
            self.traces.rto.set(rto);
            self.timers.retransmit = Some(self.schedule(rto, Timer::Retransmit));
        }

        let space = self.tx_buffer.available();
        if space > 0 {
            self.notify(Notification::SendSpace(space));
        }
        if ack > self.next_tx() {
            self.set_next_tx(ack);
        }
        if self.tx_buffer.size() == 0
            && !matches!(self.tcp_state(), TcpState::FinWait1 | TcpState::Closing)
        {
            cancel(&mut self.timers.retransmit);
        }
    }

    // -----------------------------------------------------------------------
    // Data and FIN
    // -----------------------------------------------------------------------

    pub(crate) fn received_data(&mut self, segment: &Segment) {
        let h = &segment.header;
        let len = segment.payload.len() as u32;
        let expected = self.rx_buffer.next_rx_sequence();

        if !self.rx_buffer.add(h.seq, &segment.payload) {
            log::trace!("[tcp {}] nothing new in {}..{}", self.id, h.seq, h.seq + len);
            self.send_empty_packet(flags::ACK);
            return;
        }

        let next = self.rx_buffer.next_rx_sequence();
        if next > expected {
            if !self.shutdown_recv {
                self.notify(Notification::DataReceived);
            }
            if self.close_notified {
                log::warn!("[tcp {}] data arrived after close was notified", self.id);
            }
            if self.rx_buffer.finished() && !h.has_flag(flags::FIN) {
                // A hole before an earlier FIN just filled.
                self.do_peer_close();
                return;
            }
        }

        if self.rx_buffer.size() > self.rx_buffer.available() || next > expected + len {
            // Out of order, or filled a hole.
            self.send_empty_packet(flags::ACK);
            return;
        }

        self.del_ack_count += 1;
        if self.del_ack_count >= self.config.del_ack_max_count {
            cancel(&mut self.timers.delayed_ack);
            self.del_ack_count = 0;
            self.send_empty_packet(flags::ACK);
        } else if !is_pending(&self.timers.delayed_ack) {
            let delay = self.config.del_ack_timeout;
            self.timers.delayed_ack = Some(self.schedule(delay, Timer::DelayedAck));
        }
    }

    fn peer_close(&mut self, segment: &Segment) {
        let h = &segment.header;
        let len = segment.payload.len() as u32;

        if h.seq < self.rx_buffer.next_rx_sequence() || h.seq > self.rx_buffer.max_rx_sequence() {
            log::debug!("[tcp {}] FIN at {} out of range", self.id, h.seq);
            return;
        }

        self.rx_buffer.set_fin_sequence(h.seq + len);
        if len > 0 {
            self.received_data(segment);
        }
        if !self.rx_buffer.finished() {
            return;
        }

        if self.tcp_state() == TcpState::FinWait1 {
            self.set_state(TcpState::Closing);
            self.send_empty_packet(flags::ACK);
            return;
        }
        self.do_peer_close();
    }

    fn do_peer_close(&mut self) {
        log::debug!("[tcp {}] peer closed", self.id);
        self.set_state(TcpState::CloseWait);
        if !self.close_notified {
            self.notify(Notification::NormalClose);
            self.close_notified = true;
        }
        if self.shutdown_send {
            if let Err(e) = self.close() {
                log::warn!("[tcp {}] close after peer FIN failed: {e}", self.id);
            }
        } else {
            self.send_empty_packet(flags::ACK);
        }
    }
}
