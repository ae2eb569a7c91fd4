//! Pluggable congestion control.
//!
//! A strategy implements [`CongestionOps`] and touches the congestion window
//! only through the [`TcpSocketState`] accessors.  Two strategies ship:
//!
//! | Strategy  | Increase                                  | Decrease on loss          |
//! |-----------|-------------------------------------------|---------------------------|
//! | [`NewReno`] | slow start, then +1 segment per RTT     | `max(2·MSS, flight/2)`    |
//! | [`Veno`]    | as NewReno, but every other RTT once the | `flight·4/5` if the loss |
//! |             | backlog estimate reaches β               | looks random, else /2     |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::state::CongState;
use crate::tcb::TcpSocketState;

/// Capability set of a congestion control algorithm.
pub trait CongestionOps: Send {
    fn name(&self) -> &'static str;

    /// Slow-start threshold to install after a loss with `bytes_in_flight`
    /// outstanding.  Must not mutate anything; callers use it for
    /// inspection as well.
    fn get_ssthresh(&self, tcb: &TcpSocketState, bytes_in_flight: u32) -> u32;

    /// Grow the window after `segments_acked` new segments were acknowledged.
    fn increase_window(&mut self, tcb: &mut TcpSocketState, segments_acked: u32);

    /// RTT sample hook, called for every new ACK while the sender is OPEN.
    fn pkts_acked(&mut self, _tcb: &mut TcpSocketState, _segments_acked: u32, _rtt: Duration) {}

    /// Loss-recovery sub-state change hook.
    fn congestion_state_set(&mut self, _tcb: &mut TcpSocketState, _new_state: CongState) {}

    /// Fresh copy for a forked (accepted) connection.
    fn fork(&self) -> Box<dyn CongestionOps>;
}

/// Algorithms selectable through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionAlgorithm {
    #[default]
    NewReno,
    Veno,
}

impl CongestionAlgorithm {
    pub fn build(self) -> Box<dyn CongestionOps> {
        match self {
            CongestionAlgorithm::NewReno => Box::new(NewReno),
            CongestionAlgorithm::Veno => Box::new(Veno::default()),
        }
    }
}

impl FromStr for CongestionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newreno" | "new-reno" => Ok(CongestionAlgorithm::NewReno),
            "veno" => Ok(CongestionAlgorithm::Veno),
            other => Err(format!("unknown congestion control algorithm: {other}")),
        }
    }
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionAlgorithm::NewReno => f.write_str("NewReno"),
            CongestionAlgorithm::Veno => f.write_str("Veno"),
        }
    }
}

// ---------------------------------------------------------------------------
// NewReno
// ---------------------------------------------------------------------------

/// RFC 5681 slow start and congestion avoidance.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewReno;

impl NewReno {
    /// One segment per acknowledged segment.  Returns the ACKs not consumed
    /// (always one fewer than given, since only one is applied per call).
    pub fn slow_start(tcb: &mut TcpSocketState, segments_acked: u32) -> u32 {
        if segments_acked >= 1 {
            tcb.set_cwnd(tcb.cwnd().saturating_add(tcb.segment_size));
            log::trace!("[cc] slow start: cwnd={} ssthresh={}", tcb.cwnd(), tcb.ssthresh());
            return segments_acked - 1;
        }
        0
    }

    /// Roughly one segment per window: `MSS² / cwnd` bytes, at least 1.
    pub fn congestion_avoidance(tcb: &mut TcpSocketState, segments_acked: u32) {
        if segments_acked > 0 {
            let seg = f64::from(tcb.segment_size);
            let adder = (seg * seg / f64::from(tcb.cwnd())).max(1.0);
            tcb.set_cwnd(tcb.cwnd().saturating_add(adder as u32));
            log::trace!("[cc] congestion avoidance: cwnd={}", tcb.cwnd());
        }
    }
}

impl CongestionOps for NewReno {
    fn name(&self) -> &'static str {
        "NewReno"
    }

    fn get_ssthresh(&self, tcb: &TcpSocketState, bytes_in_flight: u32) -> u32 {
        (2 * tcb.segment_size).max(bytes_in_flight / 2)
    }

    fn increase_window(&mut self, tcb: &mut TcpSocketState, mut segments_acked: u32) {
        if tcb.cwnd() < tcb.ssthresh() {
            segments_acked = Self::slow_start(tcb, segments_acked);
        }
        if tcb.cwnd() >= tcb.ssthresh() {
            Self::congestion_avoidance(tcb, segments_acked);
        }
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(*self)
    }
}

// ---------------------------------------------------------------------------
// Veno
// ---------------------------------------------------------------------------

/// Backlog threshold, in segments, above which a loss is taken as congestive.
pub const VENO_BETA: u32 = 3;

/// TCP Veno (Fu & Liew, 2003).
///
/// Estimates the number of segments queued in the network as
/// `diff = cwnd − cwnd·baseRtt/minRtt`.  Below [`VENO_BETA`] a loss is
/// treated as random and the window is cut only to 4/5; at or above it the
/// link is assumed saturated, so the window grows every other RTT.
#[derive(Debug, Clone)]
pub struct Veno {
    base_rtt: Duration,
    min_rtt: Duration,
    cnt_rtt: u32,
    doing_veno_now: bool,
    diff: u32,
    inc: bool,
    beta: u32,
}

impl Default for Veno {
    fn default() -> Self {
        Self {
            base_rtt: Duration::MAX,
            min_rtt: Duration::MAX,
            cnt_rtt: 0,
            doing_veno_now: true,
            diff: 0,
            inc: true,
            beta: VENO_BETA,
        }
    }
}

impl Veno {
    fn enable(&mut self) {
        self.doing_veno_now = true;
        self.cnt_rtt = 0;
        self.min_rtt = Duration::MAX;
    }

    fn disable(&mut self) {
        self.doing_veno_now = false;
    }

    /// Current backlog estimate in segments.
    pub fn diff(&self) -> u32 {
        self.diff
    }
}

impl CongestionOps for Veno {
    fn name(&self) -> &'static str {
        "Veno"
    }

    fn get_ssthresh(&self, tcb: &TcpSocketState, bytes_in_flight: u32) -> u32 {
        let floor = 2 * tcb.segment_size;
        if self.diff < self.beta {
            // Random loss: reduce by a fifth only.
            floor.max((f64::from(bytes_in_flight) * 4.0 / 5.0) as u32)
        } else {
            floor.max(bytes_in_flight / 2)
        }
    }

    fn pkts_acked(&mut self, _tcb: &mut TcpSocketState, _segments_acked: u32, rtt: Duration) {
        if rtt.is_zero() {
            return;
        }
        self.min_rtt = self.min_rtt.min(rtt);
        self.base_rtt = self.base_rtt.min(rtt);
        self.cnt_rtt += 1;
    }

    fn congestion_state_set(&mut self, _tcb: &mut TcpSocketState, new_state: CongState) {
        if new_state == CongState::Open {
            self.enable();
        } else {
            self.disable();
        }
    }

    fn increase_window(&mut self, tcb: &mut TcpSocketState, segments_acked: u32) {
        // The backlog estimate is refreshed even while falling back to NewReno
        // so a later loss sees an up-to-date value.
        let seg_cwnd = tcb.cwnd_in_segments();
        let ratio = self.base_rtt.as_secs_f64() / self.min_rtt.as_secs_f64();
        let target = (f64::from(seg_cwnd) * ratio) as u32;
        self.diff = seg_cwnd.saturating_sub(target);

        if !self.doing_veno_now {
            NewReno.increase_window(tcb, segments_acked);
            return;
        }

        if self.cnt_rtt <= 2 {
            // Too few samples for a trustworthy backlog estimate.
            NewReno.increase_window(tcb, segments_acked);
        } else if tcb.cwnd() < tcb.ssthresh() {
            NewReno::slow_start(tcb, segments_acked);
        } else if self.diff < self.beta {
            NewReno::congestion_avoidance(tcb, segments_acked);
        } else {
            if self.inc {
                NewReno::congestion_avoidance(tcb, segments_acked);
            }
            self.inc = !self.inc;
        }
    }

    fn fork(&self) -> Box<dyn CongestionOps> {
        Box::new(self.clone())
    }
}
