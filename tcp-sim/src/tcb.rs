//! Transmission control block shared with congestion control.
//!
//! The connection engine and the pluggable [`crate::congestion::CongestionOps`]
//! strategy both mutate the same [`TcpSocketState`].  The congestion window
//! and slow-start threshold are reachable only through accessors, so every
//! write passes through the traced value and reaches its subscribers.

use crate::seq::SequenceNumber;
use crate::state::CongState;
use crate::traced::TracedValue;

#[derive(Debug)]
pub struct TcpSocketState {
    /// Initial congestion window, in segments.
    pub initial_cwnd: u32,
    /// Initial slow-start threshold, in bytes.
    pub initial_ssthresh: u32,
    /// Maximum segment payload in bytes.
    pub segment_size: u32,
    /// Highest cumulative ACK received so far.
    pub last_acked_seq: SequenceNumber,
    /// Loss-recovery sub-state.
    pub cong_state: CongState,
    cwnd: TracedValue<u32>,
    ssthresh: TracedValue<u32>,
}

impl TcpSocketState {
    pub fn new(segment_size: u32, initial_cwnd: u32, initial_ssthresh: u32) -> Self {
        Self {
            initial_cwnd,
            initial_ssthresh,
            segment_size,
            last_acked_seq: SequenceNumber::default(),
            cong_state: CongState::Open,
            cwnd: TracedValue::new(initial_cwnd.saturating_mul(segment_size)),
            ssthresh: TracedValue::new(initial_ssthresh),
        }
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.cwnd.get()
    }

    pub fn set_cwnd(&mut self, cwnd: u32) {
        self.cwnd.set(cwnd);
    }

    /// Slow-start threshold in bytes.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh.get()
    }

    pub fn set_ssthresh(&mut self, ssthresh: u32) {
        self.ssthresh.set(ssthresh);
    }

    /// Congestion window in whole segments.
    pub fn cwnd_in_segments(&self) -> u32 {
        self.cwnd() / self.segment_size
    }

    /// Restart from the initial window, e.g. after the segment size changes.
    pub fn reset_window(&mut self) {
        self.set_cwnd(self.initial_cwnd.saturating_mul(self.segment_size));
        self.set_ssthresh(self.initial_ssthresh);
    }

    pub fn connect_cwnd(&mut self, sink: impl FnMut(u32, u32) + Send + 'static) {
        self.cwnd.connect(sink);
    }

    pub fn connect_ssthresh(&mut self, sink: impl FnMut(u32, u32) + Send + 'static) {
        self.ssthresh.connect(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn initial_window_is_in_segments() {
        let tcb = TcpSocketState::new(536, 10, u32::MAX);
        assert_eq!(tcb.cwnd(), 5360);
        assert_eq!(tcb.cwnd_in_segments(), 10);
        assert_eq!(tcb.ssthresh(), u32::MAX);
    }

    #[test]
    fn cwnd_subscribers_see_changes() {
        let last = Arc::new(AtomicU32::new(0));
        let mut tcb = TcpSocketState::new(100, 1, 1000);
        let sink = Arc::clone(&last);
        tcb.connect_cwnd(move |_, new| sink.store(new, Ordering::SeqCst));
        tcb.set_cwnd(300);
        assert_eq!(last.load(Ordering::SeqCst), 300);
    }
}
