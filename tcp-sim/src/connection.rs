//! The TCP connection engine: application calls, timers and the send path.
//!
//! [`Connection`] is the one [`TcpImplementation`] shipped by this crate.
//! It owns every piece of per-connection state; nothing in here is shared,
//! so no method needs to lock anything.  The receive path lives in
//! [`crate::input`].
//!
//! ```text
//!  send() ──▶ TxBuffer ──▶ send_pending_data ──▶ send_data_packet ──▶ L4Protocol
//!                              │    ▲                  │
//!                   next_seg ◀─┘    │ ACK              └─▶ arm RTO
//!                                   │
//!  on_segment ──▶ forward_up ──▶ received_ack ──▶ DiscardUpTo / recovery
//!
//!  RTO ──▶ retransmit_timeout ──▶ reset sent list, cwnd = 1 MSS ──▶ do_retransmit
//! ```
//!
//! Timers are scheduled closures that re-enter the engine through
//! [`SocketRef`]; at most one event of each [`Timer`] kind is pending.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TcpConfig;
use crate::congestion::CongestionOps;
use crate::endpoint::{Endpoint, EndpointCallbacks, Icmp, L4Protocol, NodeId};
use crate::error::SocketErrno;
use crate::implementation::{NegotiatedOptions, Notification, TcpImplementation, Timer};
use crate::packet::{flags, Segment, TcpHeader, TcpOption, MAX_OPTION_LEN};
use crate::rtt::{RttEstimator, RttHistory, MAX_RTO};
use crate::rx_buffer::RxBuffer;
use crate::seq::SequenceNumber;
use crate::simulator::{EventId, SimHandle};
use crate::socket::{SocketId, SocketRef};
use crate::state::{CongState, TcpState};
use crate::tcb::TcpSocketState;
use crate::trace::TcpTraces;
use crate::tx_buffer::TxBuffer;

/// SRTT used before the first sample.
pub const INITIAL_RTT_ESTIMATE: Duration = Duration::from_secs(1);
/// Largest window shift allowed by RFC 7323.
pub const MAX_WINDOW_SHIFT: u8 = 14;
const MAX_PERSIST_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_PENDING_DELAY: Duration = Duration::from_nanos(1);

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Timers {
    pub retransmit: Option<EventId>,
    pub delayed_ack: Option<EventId>,
    pub persist: Option<EventId>,
    pub time_wait: Option<EventId>,
    pub last_ack: Option<EventId>,
    pub send_pending: Option<EventId>,
}

impl Timers {
    pub fn cancel_all(&mut self) {
        for slot in [
            &mut self.retransmit,
            &mut self.delayed_ack,
            &mut self.persist,
            &mut self.time_wait,
            &mut self.last_ack,
            &mut self.send_pending,
        ] {
            cancel(slot);
        }
    }
}

pub(crate) fn cancel(slot: &mut Option<EventId>) {
    if let Some(ev) = slot.take() {
        ev.cancel();
    }
}

pub(crate) fn is_pending(slot: &Option<EventId>) -> bool {
    slot.as_ref().is_some_and(EventId::is_running)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct Connection {
    pub(crate) id: SocketId,
    pub(crate) owner: SocketRef,
    pub(crate) sim: SimHandle,
    pub(crate) l4: Arc<dyn L4Protocol>,
    pub(crate) node: NodeId,
    pub(crate) config: TcpConfig,
    pub(crate) endpoint: Option<Endpoint>,
    pub(crate) errno: Option<SocketErrno>,

    pub(crate) tx_buffer: TxBuffer,
    pub(crate) rx_buffer: RxBuffer,
    pub(crate) tcb: TcpSocketState,
    pub(crate) cong: Box<dyn CongestionOps>,
    pub(crate) rtt: RttEstimator,
    pub(crate) history: RttHistory,
    pub(crate) traces: TcpTraces,
    pub(crate) timers: Timers,
    pub(crate) persist_timeout: Duration,

    // Options, narrowed to what the peer agreed to during the handshake.
    pub(crate) win_scaling: bool,
    pub(crate) snd_wind_shift: u8,
    pub(crate) rcv_wind_shift: u8,
    pub(crate) sack: bool,
    pub(crate) timestamp: bool,
    pub(crate) timestamp_to_echo: u32,

    pub(crate) syn_count: u32,
    pub(crate) data_retr_count: u32,
    pub(crate) dup_ack_count: u32,
    pub(crate) del_ack_count: u32,
    pub(crate) bytes_acked_not_processed: u32,
    /// RecoveryPoint of RFC 6675.
    pub(crate) recover: SequenceNumber,
    pub(crate) first_partial_ack: bool,
    /// Highest acknowledgement number we have sent.
    pub(crate) high_tx_ack: SequenceNumber,

    pub(crate) connected: bool,
    pub(crate) close_notified: bool,
    pub(crate) close_on_empty: bool,
    pub(crate) shutdown_send: bool,
    pub(crate) shutdown_recv: bool,

    pub(crate) notifications: Vec<Notification>,
}

impl Connection {
    pub fn new(
        id: SocketId,
        owner: SocketRef,
        sim: SimHandle,
        l4: Arc<dyn L4Protocol>,
        node: NodeId,
        config: TcpConfig,
    ) -> Self {
        let isn = SequenceNumber::new(config.initial_sequence);
        let rtt = RttEstimator::new(INITIAL_RTT_ESTIMATE);
        let rto = rtt.rto(config.min_rto, config.clock_granularity);

        let mut tx_buffer = TxBuffer::new(isn);
        tx_buffer.set_clock(sim.clock());
        tx_buffer.set_max_buffer_size(config.snd_buf_size);
        let mut rx_buffer = RxBuffer::new(SequenceNumber::default());
        rx_buffer.set_max_buffer_size(config.rcv_buf_size);

        Self {
            id,
            owner,
            sim,
            l4,
            node,
            endpoint: None,
            errno: None,
            tx_buffer,
            rx_buffer,
            tcb: TcpSocketState::new(
                config.segment_size,
                config.initial_cwnd,
                config.initial_ssthresh,
            ),
            cong: config.congestion.build(),
            rtt,
            history: RttHistory::default(),
            traces: TcpTraces::new(isn, rto),
            timers: Timers::default(),
            persist_timeout: config.persist_timeout,
            win_scaling: config.win_scaling,
            snd_wind_shift: 0,
            rcv_wind_shift: 0,
            sack: config.sack,
            timestamp: config.timestamp,
            timestamp_to_echo: 0,
            syn_count: config.syn_retries,
            data_retr_count: config.data_retries,
            dup_ack_count: 0,
            del_ack_count: 0,
            bytes_acked_not_processed: 0,
            recover: isn,
            first_partial_ack: true,
            high_tx_ack: SequenceNumber::default(),
            connected: false,
            close_notified: false,
            close_on_empty: false,
            shutdown_send: false,
            shutdown_recv: false,
            notifications: Vec::new(),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Small accessors
    // -----------------------------------------------------------------------

    pub(crate) fn tcp_state(&self) -> TcpState {
        self.traces.state.get()
    }

    pub(crate) fn set_state(&mut self, state: TcpState) {
        let old = self.tcp_state();
        if old != state {
            log::debug!("[tcp {}] {old} -> {state}", self.id);
        }
        self.traces.state.set(state);
    }

    pub(crate) fn set_cong_state(&mut self, state: CongState) {
        if self.tcb.cong_state != state {
            log::debug!("[tcp {}] {} -> {state}", self.id, self.tcb.cong_state);
        }
        self.cong.congestion_state_set(&mut self.tcb, state);
        self.tcb.cong_state = state;
        self.traces.cong_state.set(state);
    }

    pub(crate) fn next_tx(&self) -> SequenceNumber {
        self.traces.next_tx.get()
    }

    pub(crate) fn set_next_tx(&mut self, seq: SequenceNumber) {
        self.traces.next_tx.set(seq);
    }

    pub(crate) fn high_tx(&self) -> SequenceNumber {
        self.traces.high_tx.get()
    }

    pub(crate) fn set_high_tx(&mut self, seq: SequenceNumber) {
        self.traces.high_tx.set(seq);
    }

    pub(crate) fn rwnd(&self) -> u32 {
        self.traces.rwnd.get()
    }

    pub(crate) fn now_ms(&self) -> u32 {
        self.sim.now().as_millis() as u32
    }

    /// `(local, peer)` of a connected endpoint.
    pub(crate) fn addresses(&self) -> Option<(SocketAddr, SocketAddr)> {
        let ep = self.endpoint.as_ref()?;
        Some((ep.local, ep.peer?))
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub(crate) fn fail<T>(&mut self, errno: SocketErrno) -> Result<T, SocketErrno> {
        self.errno = Some(errno);
        Err(errno)
    }

    pub(crate) fn schedule(&self, delay: Duration, timer: Timer) -> EventId {
        let owner = self.owner.clone();
        self.sim
            .schedule_with_context(self.node, delay, move || owner.fire(timer))
    }

    /// RFC 6298 (2.4) with the configured floor.
    pub(crate) fn compute_rto(&self) -> Duration {
        self.rtt
            .rto(self.config.min_rto, self.config.clock_granularity)
    }

    // -----------------------------------------------------------------------
    // Windows
    // -----------------------------------------------------------------------

    /// RFC 6675 pipe, also published on the `bytes_in_flight` trace.
    pub(crate) fn bytes_in_flight(&mut self) -> u32 {
        let pipe = self
            .tx_buffer
            .bytes_in_flight(self.config.retx_thresh, self.tcb.segment_size);
        self.traces.bytes_in_flight.set(pipe);
        pipe
    }

    /// Bytes sent and not yet cumulatively acknowledged.
    pub(crate) fn unack_data_count(&self) -> u32 {
        let head = self.tx_buffer.head_sequence();
        let high = self.high_tx();
        if high > head {
            high - head
        } else {
            0
        }
    }

    /// Bytes the peer and the network allow to be outstanding.
    pub(crate) fn window(&self) -> u32 {
        self.rwnd().min(self.tcb.cwnd())
    }

    pub(crate) fn available_window(&mut self) -> u32 {
        let win = self.window();
        let inflight = self.bytes_in_flight();
        win.saturating_sub(inflight)
    }

    /// Free receive space, scaled unless `scale` is false (SYN segments).
    pub(crate) fn advertised_window(&self, scale: bool) -> u16 {
        let free = self.rx_buffer.max_rx_sequence() - self.rx_buffer.next_rx_sequence();
        let w = if scale { free >> self.rcv_wind_shift } else { free };
        w.min(u32::from(self.config.max_win_size)) as u16
    }

    /// Smallest shift that fits the receive buffer into `max_win_size`.
    fn compute_rcv_shift(&self) -> u8 {
        let space = self.rx_buffer.max_buffer_size();
        let max_win = u32::from(self.config.max_win_size).max(1);
        let mut shift = 0u8;
        while shift < MAX_WINDOW_SHIFT && (space >> shift) > max_win {
            shift += 1;
        }
        shift
    }

    // -----------------------------------------------------------------------
    // Options
    // -----------------------------------------------------------------------

    pub(crate) fn add_options(&self, header: &mut TcpHeader) {
        if self.timestamp {
            header.append_option(TcpOption::Timestamp {
                value: self.now_ms(),
                echo: self.timestamp_to_echo,
            });
        }
    }

    fn add_sack_blocks(&self, header: &mut TcpHeader) {
        let room = MAX_OPTION_LEN.saturating_sub(header.options_len() + 2) / 8;
        if room == 0 || self.rx_buffer.sack_list_len() == 0 {
            return;
        }
        let blocks: Vec<_> = self.rx_buffer.sack_list().take(room).copied().collect();
        log::trace!("[tcp {}] advertising {} SACK block(s)", self.id, blocks.len());
        header.append_option(TcpOption::Sack(blocks));
    }

    /// Narrow the options to what the peer's SYN (or SYN-ACK) carried.
    pub(crate) fn process_syn_options(&mut self, header: &TcpHeader) {
        if self.win_scaling {
            match header.option(crate::packet::option_kind::WINDOW_SCALE) {
                Some(TcpOption::WindowScale(shift)) => {
                    self.snd_wind_shift = (*shift).min(MAX_WINDOW_SHIFT);
                    if *shift > MAX_WINDOW_SHIFT {
                        log::warn!("[tcp {}] peer window shift {shift} capped", self.id);
                    }
                }
                _ => {
                    self.win_scaling = false;
                    self.snd_wind_shift = 0;
                    self.rcv_wind_shift = 0;
                }
            }
        }
        if self.sack && !header.has_option(crate::packet::option_kind::SACK_PERMITTED) {
            self.sack = false;
        }
        if self.timestamp {
            match header.option(crate::packet::option_kind::TIMESTAMP) {
                Some(TcpOption::Timestamp { value, .. }) => self.timestamp_to_echo = *value,
                _ => self.timestamp = false,
            }
        }
        log::debug!(
            "[tcp {}] negotiated: wscale={} sack={} ts={}",
            self.id,
            self.win_scaling,
            self.sack,
            self.timestamp
        );
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Send a segment without payload.
    pub(crate) fn send_empty_packet(&mut self, mut seg_flags: u8) {
        let Some((local, peer)) = self.addresses() else {
            log::warn!(
                "[tcp {}] no endpoint, cannot send [{}]",
                self.id,
                flags::describe(seg_flags)
            );
            return;
        };

        let mut seq = self.next_tx();
        if seg_flags & flags::FIN != 0 {
            seg_flags |= flags::ACK;
        } else if matches!(
            self.tcp_state(),
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::LastAck
                | TcpState::Closing
                | TcpState::TimeWait
        ) {
            // Our FIN already took NextTx.
            seq += 1;
        }

        let is_syn = seg_flags & flags::SYN != 0;
        let is_ack = seg_flags & flags::ACK != 0;
        let mut header = TcpHeader {
            source_port: local.port(),
            destination_port: peer.port(),
            seq,
            ack: self.rx_buffer.next_rx_sequence(),
            flags: seg_flags,
            window: self.advertised_window(!is_syn),
            options: Vec::new(),
        };
        self.add_options(&mut header);

        let mut rto = self.compute_rto();
        if is_syn {
            if self.win_scaling {
                self.rcv_wind_shift = self.compute_rcv_shift();
                header.append_option(TcpOption::WindowScale(self.rcv_wind_shift));
            }
            if self.sack {
                header.append_option(TcpOption::SackPermitted);
            }
            if self.syn_count == 0 {
                log::info!("[tcp {}] SYN retries exhausted", self.id);
                self.rtt.reset();
                if self.tcp_state() == TcpState::SynSent {
                    self.connection_failed();
                } else {
                    self.close_and_notify();
                }
                return;
            }
            let backoff = self.config.syn_retries - self.syn_count;
            rto = self
                .config
                .conn_timeout
                .checked_mul(1u32 << backoff.min(16))
                .unwrap_or(MAX_RTO);
            self.syn_count -= 1;
            if self.syn_count + 1 == self.config.syn_retries {
                self.history.record(seq, 0, self.sim.now(), false);
            } else {
                // Karn: an ACK of a repeated SYN gives no sample.
                self.history.clear();
            }
        }
        self.traces.rto.set(rto);

        if is_ack {
            cancel(&mut self.timers.delayed_ack);
            self.del_ack_count = 0;
            if self.high_tx_ack < header.ack {
                self.high_tx_ack = header.ack;
            }
            if self.sack {
                self.add_sack_blocks(&mut header);
            }
        }

        log::trace!("[tcp {}] -> {header}", self.id);
        self.traces.tx.fire(&header, &[], self.id);
        self.l4.send_packet(Segment::new(header, Vec::new()), local, peer);

        if seg_flags & (flags::SYN | flags::FIN) != 0 && !is_pending(&self.timers.retransmit) {
            self.timers.retransmit = Some(self.schedule(rto, Timer::ResendControl(seg_flags)));
        }
    }

    /// RST the peer, report an error close and release the endpoint.
    pub(crate) fn send_rst(&mut self) {
        self.send_empty_packet(flags::RST);
        self.abort();
    }

    /// Give up on the connection without telling the peer.
    pub(crate) fn abort(&mut self) {
        if !self.close_notified {
            self.notify(Notification::ErrorClose);
            self.close_notified = true;
        }
        self.set_state(TcpState::Closed);
        self.deallocate_endpoint();
    }

    /// Transmit what the windows allow.  Returns the number of segments sent.
    pub(crate) fn send_pending_data(&mut self, with_ack: bool) -> u32 {
        if self.tx_buffer.size() == 0 || self.endpoint.is_none() {
            return 0;
        }
        let seg_size = self.tcb.segment_size;
        let mut sent = 0;
        loop {
            let avail = self.available_window();
            if avail == 0 {
                break;
            }
            if self.tcb.cong_state == CongState::Open && self.tcp_state() == TcpState::FinWait1 {
                log::trace!("[tcp {}] FIN_WAIT_1, nothing more to send", self.id);
                break;
            }
            let rule3 = self.sack && self.tcb.cong_state == CongState::Recovery;
            let Some(next) =
                self.tx_buffer
                    .next_seg(self.config.retx_thresh, seg_size, rule3)
            else {
                break;
            };
            let available_data = self.tx_buffer.size_from_sequence(next);

            // Silly window syndrome: wait for the window to open.
            if avail < seg_size && available_data > avail {
                log::trace!("[tcp {}] SWS avoidance, window {avail}", self.id);
                break;
            }
            // Nagle: no small segment while data is unacknowledged.
            if !self.config.tcp_no_delay
                && self.unack_data_count() > 0
                && available_data < seg_size
            {
                log::trace!("[tcp {}] Nagle holds {available_data} bytes", self.id);
                break;
            }

            let s = avail.min(seg_size);
            self.set_next_tx(next);
            let sz = self.send_data_packet(next, s, with_ack);
            if sz == 0 {
                break;
            }
            sent += 1;
            self.set_next_tx(next + sz);
        }
        if sent > 0 {
            log::trace!(
                "[tcp {}] sent {sent} segment(s), next_tx={} cwnd={} rwnd={}",
                self.id,
                self.next_tx(),
                self.tcb.cwnd(),
                self.rwnd()
            );
        }
        sent
    }

    /// Extract up to `max` bytes at `seq` and send them.  Returns the payload
    /// size actually sent.
    pub(crate) fn send_data_packet(&mut self, seq: SequenceNumber, max: u32, with_ack: bool) -> u32 {
        let Some((local, peer)) = self.addresses() else {
            return 0;
        };
        let retransmission = seq != self.high_tx();
        let payload = self.tx_buffer.copy_from_sequence(max, seq);
        let sz = payload.len() as u32;
        if sz == 0 {
            return 0;
        }

        let mut seg_flags = if with_ack { flags::ACK } else { 0 };
        if with_ack {
            cancel(&mut self.timers.delayed_ack);
            self.del_ack_count = 0;
        }

        if self.close_on_empty && self.tx_buffer.size_from_sequence(seq + sz) == 0 {
            seg_flags |= flags::FIN;
            match self.tcp_state() {
                TcpState::Established => self.set_state(TcpState::FinWait1),
                TcpState::CloseWait => self.enter_last_ack(),
                _ => {}
            }
        }

        let mut header = TcpHeader {
            source_port: local.port(),
            destination_port: peer.port(),
            seq,
            ack: self.rx_buffer.next_rx_sequence(),
            flags: seg_flags,
            window: self.advertised_window(true),
            options: Vec::new(),
        };
        self.add_options(&mut header);
        if with_ack && self.high_tx_ack < header.ack {
            self.high_tx_ack = header.ack;
        }

        if !is_pending(&self.timers.retransmit) {
            let rto = self.traces.rto.get();
            self.timers.retransmit = Some(self.schedule(rto, Timer::Retransmit));
        }

        log::trace!("[tcp {}] -> {header} len={sz}", self.id);
        self.traces.tx.fire(&header, &payload, self.id);
        self.l4.send_packet(Segment::new(header, payload), local, peer);

        self.history.record(seq, sz, self.sim.now(), retransmission);

        let end = seq + sz;
        if end > self.high_tx() {
            let fresh = end - self.high_tx();
            self.notify(Notification::DataSent(fresh));
            self.set_high_tx(end);
        }
        sz
    }

    /// Send the FIN deferred by close-on-empty once the buffer has drained.
    pub(crate) fn maybe_send_deferred_fin(&mut self) {
        if !self.close_on_empty || self.tx_buffer.size() != 0 {
            return;
        }
        match self.tcp_state() {
            TcpState::Established => {
                self.send_empty_packet(flags::FIN);
                self.set_state(TcpState::FinWait1);
            }
            TcpState::CloseWait => {
                self.send_empty_packet(flags::FIN);
                self.enter_last_ack();
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Retransmission
    // -----------------------------------------------------------------------

    pub(crate) fn retransmit_timeout(&mut self) {
        let state = self.tcp_state();
        if matches!(state, TcpState::Closed | TcpState::TimeWait) {
            return;
        }
        // Only a state waiting for its own FIN has something outstanding
        // once every sent byte is acknowledged.
        let fin_outstanding = matches!(
            state,
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
        );
        if !fin_outstanding && self.tx_buffer.head_sequence() >= self.high_tx() {
            log::trace!("[tcp {}] RTO with nothing in flight in {state}", self.id);
            return;
        }

        let in_flight = self.bytes_in_flight();
        let head_retransmitted = self.tx_buffer.is_head_retransmitted();
        self.tx_buffer.reset_sent_list();
        self.recover = self.high_tx();

        let rto = self.traces.rto.get().saturating_mul(2).min(MAX_RTO);
        self.traces.rto.set(rto);
        self.history.clear();
        self.dup_ack_count = 0;

        if !(self.tcb.cong_state == CongState::Loss && head_retransmitted) {
            let ssthresh = self.cong.get_ssthresh(&self.tcb, in_flight);
            self.tcb.set_ssthresh(ssthresh);
        }
        self.tcb.set_cwnd(self.tcb.segment_size);
        self.set_cong_state(CongState::Loss);
        log::debug!(
            "[tcp {}] RTO: rto={rto:?} cwnd={} ssthresh={} recover={}",
            self.id,
            self.tcb.cwnd(),
            self.tcb.ssthresh(),
            self.recover
        );

        let pipe = self.bytes_in_flight();
        assert_eq!(pipe, 0, "bytes in flight after resetting the sent list");

        self.do_retransmit();

        let pipe = self.bytes_in_flight();
        assert!(
            pipe <= self.tcb.segment_size,
            "{pipe} bytes in flight after an RTO retransmission"
        );
    }

    /// Retransmit after a timeout: the SYN, the head of the buffer, or a
    /// lone FIN.
    pub(crate) fn do_retransmit(&mut self) {
        let state = self.tcp_state();
        if state == TcpState::SynSent {
            if self.syn_count > 0 {
                self.send_empty_packet(flags::SYN);
            } else {
                self.connection_failed();
            }
            return;
        }

        if self.data_retr_count == 0 {
            log::info!("[tcp {}] data retries exhausted, aborting", self.id);
            self.abort();
            return;
        }
        self.data_retr_count -= 1;

        if self.tx_buffer.size() == 0 {
            if matches!(state, TcpState::FinWait1 | TcpState::Closing) {
                self.send_empty_packet(flags::FIN);
            }
            return;
        }

        let head = self.tx_buffer.head_sequence();
        let sz = self.send_data_packet(head, self.tcb.segment_size, true);
        self.set_next_tx(head + sz);
    }

    /// Fast retransmit of the first unacknowledged segment.
    pub(crate) fn retransmit_head(&mut self) {
        let head = self.tx_buffer.head_sequence();
        self.tx_buffer.mark_head_as_lost();
        let sz = self.send_data_packet(head, self.tcb.segment_size, true);
        log::debug!("[tcp {}] fast retransmit of {head} ({sz} bytes)", self.id);
        if head + sz > self.next_tx() {
            self.set_next_tx(head + sz);
        }
    }

    fn persist_timeout(&mut self) {
        log::debug!("[tcp {}] zero-window probe", self.id);
        self.persist_timeout = self.persist_timeout.saturating_mul(2).min(MAX_PERSIST_TIMEOUT);
        if let Some((local, peer)) = self.addresses() {
            let next = self.next_tx();
            let payload = if self.tx_buffer.size_from_sequence(next) > 0 {
                self.tx_buffer.copy_from_sequence(1, next)
            } else {
                Vec::new()
            };
            let mut header = TcpHeader {
                source_port: local.port(),
                destination_port: peer.port(),
                seq: next,
                ack: self.rx_buffer.next_rx_sequence(),
                flags: flags::ACK,
                window: self.advertised_window(true),
                options: Vec::new(),
            };
            self.add_options(&mut header);
            self.traces.tx.fire(&header, &payload, self.id);
            let end = next + payload.len() as u32;
            self.l4.send_packet(Segment::new(header, payload), local, peer);
            // The probe byte moved into the sent list.
            if end > self.high_tx() {
                self.notify(Notification::DataSent(end - self.high_tx()));
                self.set_high_tx(end);
            }
            if end > self.next_tx() {
                self.set_next_tx(end);
            }
        }
        self.timers.persist = Some(self.schedule(self.persist_timeout, Timer::Persist));
    }

    pub(crate) fn start_persist(&mut self) {
        log::debug!("[tcp {}] zero window, entering persist", self.id);
        cancel(&mut self.timers.retransmit);
        self.timers.persist = Some(self.schedule(self.persist_timeout, Timer::Persist));
    }

    // -----------------------------------------------------------------------
    // Connection teardown
    // -----------------------------------------------------------------------

    pub(crate) fn enter_last_ack(&mut self) {
        self.set_state(TcpState::LastAck);
        self.data_retr_count = self.config.data_retries;
        cancel(&mut self.timers.last_ack);
        let last_rto = self.rtt.estimate()
            + self
                .config
                .clock_granularity
                .max(self.rtt.variation().saturating_mul(4));
        self.timers.last_ack = Some(self.schedule(last_rto, Timer::LastAck));
    }

    pub(crate) fn time_wait(&mut self) {
        self.set_state(TcpState::TimeWait);
        self.timers.cancel_all();
        if !self.close_notified {
            self.notify(Notification::NormalClose);
            self.close_notified = true;
        }
        let linger = self.config.msl.saturating_mul(2);
        self.timers.time_wait = Some(self.schedule(linger, Timer::TimeWait));
    }

    pub(crate) fn close_and_notify(&mut self) {
        if !self.close_notified {
            self.notify(Notification::NormalClose);
            self.close_notified = true;
        }
        self.set_state(TcpState::Closed);
        self.deallocate_endpoint();
    }

    pub(crate) fn connection_failed(&mut self) {
        log::info!("[tcp {}] connection failed", self.id);
        self.notify(Notification::ConnectionFailed);
        self.close_notified = true;
        self.set_state(TcpState::Closed);
        self.deallocate_endpoint();
    }

    pub(crate) fn deallocate_endpoint(&mut self) {
        self.timers.cancel_all();
        if let Some(ep) = self.endpoint.take() {
            log::trace!("[tcp {}] releasing endpoint {ep}", self.id);
            self.l4.deallocate(ep.id);
        }
    }

    fn do_close(&mut self) -> Result<(), SocketErrno> {
        match self.tcp_state() {
            TcpState::SynRcvd | TcpState::Established => {
                self.send_empty_packet(flags::FIN);
                self.set_state(TcpState::FinWait1);
            }
            TcpState::CloseWait => {
                self.send_empty_packet(flags::FIN | flags::ACK);
                self.enter_last_ack();
            }
            TcpState::SynSent | TcpState::Closing => {
                self.send_rst();
            }
            TcpState::Listen | TcpState::LastAck => self.close_and_notify(),
            TcpState::Closed | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::TimeWait => {}
        }
        Ok(())
    }

    fn do_connect(&mut self) -> Result<(), SocketErrno> {
        match self.tcp_state() {
            TcpState::Closed
            | TcpState::Listen
            | TcpState::SynSent
            | TcpState::LastAck
            | TcpState::CloseWait => {
                self.send_empty_packet(flags::SYN);
                if self.endpoint.is_some() {
                    self.set_state(TcpState::SynSent);
                }
                Ok(())
            }
            TcpState::TimeWait => self.fail(SocketErrno::Inval),
            _ => {
                self.send_rst();
                self.fail(SocketErrno::Inval)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Endpoint wiring
    // -----------------------------------------------------------------------

    /// Route the endpoint's events to the owning socket.
    pub(crate) fn setup_callbacks(&mut self) {
        let Some(ep) = self.endpoint.as_ref() else {
            return;
        };
        let Some(socket) = self.owner.upgrade() else {
            log::warn!("[tcp {}] socket gone, endpoint left without callbacks", self.id);
            return;
        };
        let rx_socket = socket.clone();
        let icmp_socket = socket;
        let destroy_ref = self.owner.clone();
        let callbacks = EndpointCallbacks {
            rx: Some(Arc::new(move |segment, from, to| {
                rx_socket.forward_up(segment, from, to)
            })),
            icmp: Some(Arc::new(move |icmp| icmp_socket.forward_icmp(icmp))),
            destroy: Some(Arc::new(move || {
                if let Some(socket) = destroy_ref.upgrade() {
                    socket.endpoint_destroyed();
                }
            })),
        };
        self.l4.set_callbacks(ep.id, callbacks);
    }
}

// ---------------------------------------------------------------------------
// TcpImplementation
// ---------------------------------------------------------------------------

impl TcpImplementation for Connection {
    fn id(&self) -> SocketId {
        self.id
    }

    fn state(&self) -> TcpState {
        self.tcp_state()
    }

    fn errno(&self) -> Option<SocketErrno> {
        self.errno
    }

    fn config(&self) -> &TcpConfig {
        &self.config
    }

    fn reconfigure(&mut self, config: TcpConfig) -> Result<(), SocketErrno> {
        let closed = self.tcp_state() == TcpState::Closed;
        if !closed && config.segment_size != self.config.segment_size {
            return self.fail(SocketErrno::Inval);
        }
        self.tx_buffer.set_max_buffer_size(config.snd_buf_size);
        self.rx_buffer.set_max_buffer_size(config.rcv_buf_size);
        if closed {
            let isn = SequenceNumber::new(config.initial_sequence);
            self.tcb = TcpSocketState::new(
                config.segment_size,
                config.initial_cwnd,
                config.initial_ssthresh,
            );
            self.cong = config.congestion.build();
            if self.tx_buffer.sent_size() == 0 {
                self.tx_buffer.set_head_sequence(isn);
                self.set_next_tx(isn);
                self.set_high_tx(isn);
                self.recover = isn;
            }
            self.win_scaling = config.win_scaling;
            self.sack = config.sack;
            self.timestamp = config.timestamp;
            self.syn_count = config.syn_retries;
            self.data_retr_count = config.data_retries;
            self.persist_timeout = config.persist_timeout;
            self.traces.rto.set(
                self.rtt
                    .rto(config.min_rto, config.clock_granularity),
            );
        }
        self.config = config;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(|ep| ep.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|ep| ep.peer)
    }

    fn negotiated(&self) -> NegotiatedOptions {
        NegotiatedOptions {
            sack: self.sack,
            timestamp: self.timestamp,
            window_scale: self
                .win_scaling
                .then_some((self.snd_wind_shift, self.rcv_wind_shift)),
        }
    }

    fn tcb(&self) -> &TcpSocketState {
        &self.tcb
    }

    fn tcb_mut(&mut self) -> &mut TcpSocketState {
        &mut self.tcb
    }

    fn traces(&self) -> &TcpTraces {
        &self.traces
    }

    fn traces_mut(&mut self) -> &mut TcpTraces {
        &mut self.traces
    }

    fn bind(&mut self, local: Option<SocketAddr>) -> Result<(), SocketErrno> {
        if self.endpoint.is_some() {
            return self.fail(SocketErrno::Inval);
        }
        match self.l4.allocate(self.node, local) {
            Ok(ep) => {
                log::debug!("[tcp {}] bound to {}", self.id, ep.local);
                self.endpoint = Some(ep);
                self.setup_callbacks();
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn connect(&mut self, peer: SocketAddr) -> Result<(), SocketErrno> {
        if self.endpoint.is_none() {
            self.bind(None)?;
        }
        let Some(ep_id) = self.endpoint.as_ref().map(|ep| ep.id) else {
            return self.fail(SocketErrno::Inval);
        };
        let source = match self.l4.route_output(self.node, peer.ip()) {
            Ok(ip) => ip,
            Err(e) => return self.fail(e),
        };
        match self.l4.connect_endpoint(ep_id, source, peer) {
            Ok(ep) => self.endpoint = Some(ep),
            Err(e) => return self.fail(e),
        }
        log::debug!("[tcp {}] connecting {source} -> {peer}", self.id);

        self.rtt.reset();
        self.syn_count = self.config.syn_retries;
        self.data_retr_count = self.config.data_retries;
        self.do_connect()
    }

    fn listen(&mut self) -> Result<(), SocketErrno> {
        if self.tcp_state() != TcpState::Closed {
            return self.fail(SocketErrno::Inval);
        }
        if self.endpoint.is_none() {
            self.bind(None)?;
        }
        self.set_state(TcpState::Listen);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, SocketErrno> {
        let state = self.tcp_state();
        if !matches!(
            state,
            TcpState::Established | TcpState::SynSent | TcpState::CloseWait
        ) {
            return self.fail(SocketErrno::NotConn);
        }
        if self.shutdown_send {
            return self.fail(SocketErrno::Shutdown);
        }
        if !self.tx_buffer.add(data) {
            return self.fail(SocketErrno::MsgSize);
        }
        if matches!(state, TcpState::Established | TcpState::CloseWait)
            && self.available_window() > 0
            && !is_pending(&self.timers.send_pending)
        {
            self.timers.send_pending = Some(self.schedule(SEND_PENDING_DELAY, Timer::SendPending));
        }
        Ok(data.len())
    }

    fn recv(&mut self, max: u32) -> Option<Vec<u8>> {
        if self.rx_buffer.size() == 0 && self.tcp_state() == TcpState::CloseWait {
            return Some(Vec::new());
        }
        if self.rx_buffer.available() == 0 {
            return None;
        }
        let was_closed = self.advertised_window(true) == 0;
        let data = self.rx_buffer.extract(max);
        if was_closed && self.advertised_window(true) > 0 && self.tcp_state().is_synchronized() {
            log::debug!("[tcp {}] window reopened, sending update", self.id);
            self.send_empty_packet(flags::ACK);
        }
        Some(data)
    }

    fn close(&mut self) -> Result<(), SocketErrno> {
        if self.rx_buffer.size() != 0 {
            log::warn!(
                "[tcp {}] closing with {} unread bytes, sending RST",
                self.id,
                self.rx_buffer.size()
            );
            self.send_rst();
            return Ok(());
        }
        let next = self.next_tx();
        if next < self.tx_buffer.tail_sequence() && self.tx_buffer.size_from_sequence(next) > 0 {
            if !self.close_on_empty {
                log::debug!("[tcp {}] deferring close in {}", self.id, self.tcp_state());
                self.close_on_empty = true;
            }
            return Ok(());
        }
        self.do_close()
    }

    fn shutdown_send(&mut self) -> Result<(), SocketErrno> {
        self.shutdown_send = true;
        self.close_on_empty = true;
        if self.tx_buffer.size() == 0 {
            self.maybe_send_deferred_fin();
        }
        Ok(())
    }

    fn shutdown_recv(&mut self) -> Result<(), SocketErrno> {
        self.shutdown_recv = true;
        Ok(())
    }

    fn tx_available(&self) -> u32 {
        self.tx_buffer.available()
    }

    fn rx_available(&self) -> u32 {
        self.rx_buffer.available()
    }

    fn on_segment(&mut self, segment: Segment, from: SocketAddr, to: SocketAddr) {
        self.forward_up(segment, from, to);
    }

    fn on_icmp(&mut self, icmp: Icmp) {
        log::debug!("[tcp {}] ICMP from {} type {} code {}", self.id, icmp.source, icmp.kind, icmp.code);
        self.notify(Notification::Icmp(icmp));
    }

    fn on_timer(&mut self, timer: Timer) {
        log::trace!("[tcp {}] timer {timer:?} in {}", self.id, self.tcp_state());
        match timer {
            Timer::Retransmit => self.retransmit_timeout(),
            Timer::ResendControl(seg_flags) => {
                let state = self.tcp_state();
                if seg_flags & flags::SYN != 0 {
                    if matches!(state, TcpState::SynSent | TcpState::SynRcvd) {
                        self.send_empty_packet(seg_flags);
                    }
                } else if matches!(
                    state,
                    TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck
                ) {
                    if self.data_retr_count == 0 {
                        log::info!("[tcp {}] FIN never acknowledged, aborting", self.id);
                        self.abort();
                        return;
                    }
                    self.data_retr_count -= 1;
                    self.send_empty_packet(seg_flags);
                }
            }
            Timer::DelayedAck => {
                self.del_ack_count = 0;
                self.send_empty_packet(flags::ACK);
            }
            Timer::Persist => self.persist_timeout(),
            Timer::TimeWait => self.close_and_notify(),
            Timer::LastAck => {
                if self.tcp_state() == TcpState::LastAck {
                    self.close_and_notify();
                }
            }
            Timer::SendPending => {
                let connected = self.connected;
                self.send_pending_data(connected);
            }
        }
    }

    fn on_endpoint_destroyed(&mut self) {
        log::debug!("[tcp {}] endpoint destroyed by the network", self.id);
        self.endpoint = None;
        self.timers.cancel_all();
    }

    fn fork(&self, id: SocketId, owner: SocketRef) -> Box<dyn TcpImplementation> {
        let mut child = Connection::new(
            id,
            owner,
            self.sim.clone(),
            Arc::clone(&self.l4),
            self.node,
            self.config.clone(),
        );
        child.cong = self.cong.fork();
        child.set_state(self.tcp_state());
        Box::new(child)
    }

    fn complete_fork(&mut self, syn: Segment, from: SocketAddr, to: SocketAddr) {
        match self.l4.allocate_full(self.node, to, from) {
            Ok(ep) => self.endpoint = Some(ep),
            Err(e) => {
                log::warn!("[tcp {}] cannot bind {to} <-> {from}: {e}", self.id);
                self.set_state(TcpState::Closed);
                return;
            }
        }
        self.setup_callbacks();

        self.traces.rwnd.set(u32::from(syn.header.window));
        self.process_syn_options(&syn.header);
        self.set_state(TcpState::SynRcvd);
        self.syn_count = self.config.syn_retries;
        self.data_retr_count = self.config.data_retries;
        let next_rx = syn.header.seq + 1;
        self.rx_buffer.set_next_rx_sequence(next_rx);
        self.high_tx_ack = next_rx;
        self.traces.high_rx.set(syn.header.seq);
        self.send_empty_packet(flags::SYN | flags::ACK);
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}
