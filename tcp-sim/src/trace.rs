//! Per-connection observables.
//!
//! | Trace             | Meaning                                   |
//! |-------------------|-------------------------------------------|
//! | `rto`             | current retransmission timeout            |
//! | `last_rtt`        | most recent RTT sample                    |
//! | `next_tx`         | next sequence number to send (SND.NXT)    |
//! | `high_tx`         | highest sequence number sent              |
//! | `rwnd`            | peer's advertised window, scaled          |
//! | `bytes_in_flight` | RFC 6675 pipe                             |
//! | `high_rx`         | highest sequence number received          |
//! | `high_rx_ack`     | highest acknowledgement received          |
//! | `state`           | connection state                          |
//! | `cong_state`      | loss-recovery sub-state                   |
//! | `tx` / `rx`       | every segment sent / received             |
//!
//! The congestion window and slow-start threshold live in
//! [`crate::tcb::TcpSocketState`].

use std::time::Duration;

use crate::seq::SequenceNumber;
use crate::state::{CongState, TcpState};
use crate::traced::{SegmentTrace, TracedValue};

#[derive(Debug)]
pub struct TcpTraces {
    pub rto: TracedValue<Duration>,
    pub last_rtt: TracedValue<Duration>,
    pub next_tx: TracedValue<SequenceNumber>,
    pub high_tx: TracedValue<SequenceNumber>,
    pub rwnd: TracedValue<u32>,
    pub bytes_in_flight: TracedValue<u32>,
    pub high_rx: TracedValue<SequenceNumber>,
    pub high_rx_ack: TracedValue<SequenceNumber>,
    pub state: TracedValue<TcpState>,
    pub cong_state: TracedValue<CongState>,
    pub tx: SegmentTrace,
    pub rx: SegmentTrace,
}

impl TcpTraces {
    pub fn new(initial_sequence: SequenceNumber, initial_rto: Duration) -> Self {
        Self {
            rto: TracedValue::new(initial_rto),
            last_rtt: TracedValue::new(Duration::ZERO),
            next_tx: TracedValue::new(initial_sequence),
            high_tx: TracedValue::new(initial_sequence),
            rwnd: TracedValue::new(0),
            bytes_in_flight: TracedValue::new(0),
            high_rx: TracedValue::new(SequenceNumber::default()),
            high_rx_ack: TracedValue::new(SequenceNumber::default()),
            state: TracedValue::new(TcpState::Closed),
            cong_state: TracedValue::new(CongState::Open),
            tx: SegmentTrace::default(),
            rx: SegmentTrace::default(),
        }
    }
}
