//! Tunable parameters for sockets, links and the scheduler.
//!
//! All structs implement [`Default`] with the values a freshly created
//! socket starts from; callers override individual fields with struct
//! update syntax:
//!
//! ```
//! use tcp_sim::config::TcpConfig;
//! let cfg = TcpConfig { sack: true, ..TcpConfig::default() };
//! assert_eq!(cfg.segment_size, 536);
//! ```

use std::time::Duration;

use crate::congestion::CongestionAlgorithm;

/// Per-socket TCP attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpConfig {
    /// Send buffer capacity in bytes.
    pub snd_buf_size: u32,
    /// Receive buffer capacity in bytes.
    pub rcv_buf_size: u32,
    /// Maximum segment payload.  Fixed once the socket leaves CLOSED.
    pub segment_size: u32,
    /// Initial congestion window, in segments.
    pub initial_cwnd: u32,
    /// Initial slow-start threshold, in bytes.
    pub initial_ssthresh: u32,
    /// Base timeout for SYN retransmission.
    pub conn_timeout: Duration,
    /// SYN retransmissions before giving up.
    pub syn_retries: u32,
    /// Data retransmissions before giving up.
    pub data_retries: u32,
    /// Delayed-ACK timer.
    pub del_ack_timeout: Duration,
    /// In-order segments received before an immediate ACK is forced.
    pub del_ack_max_count: u32,
    /// Disable Nagle's algorithm when `true`.
    pub tcp_no_delay: bool,
    /// Initial zero-window probe interval.
    pub persist_timeout: Duration,
    /// Maximum segment lifetime; TIME_WAIT lasts twice this.
    pub msl: Duration,
    /// Largest window value advertised before scaling.
    pub max_win_size: u16,
    /// Offer the window-scale option on SYN.
    pub win_scaling: bool,
    /// Offer SACK-permitted on SYN.
    pub sack: bool,
    /// Offer the timestamp option on SYN.
    pub timestamp: bool,
    /// Lower bound for the retransmission timeout.
    pub min_rto: Duration,
    /// Timer granularity term of the RTO formula.
    pub clock_granularity: Duration,
    /// Duplicate ACKs that trigger fast retransmit.
    pub retx_thresh: u32,
    /// Enable RFC 3042 limited transmit.
    pub limited_transmit: bool,
    /// Initial send sequence number.
    pub initial_sequence: u32,
    /// Congestion control algorithm installed on new sockets.
    pub congestion: CongestionAlgorithm,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            snd_buf_size: 131_072,
            rcv_buf_size: 131_072,
            segment_size: 536,
            initial_cwnd: 1,
            initial_ssthresh: u32::MAX,
            conn_timeout: Duration::from_secs(3),
            syn_retries: 6,
            data_retries: 6,
            del_ack_timeout: Duration::from_millis(200),
            del_ack_max_count: 2,
            tcp_no_delay: true,
            persist_timeout: Duration::from_secs(6),
            msl: Duration::from_secs(120),
            max_win_size: 65_535,
            win_scaling: true,
            sack: false,
            timestamp: true,
            min_rto: Duration::from_secs(1),
            clock_granularity: Duration::from_millis(1),
            retx_thresh: 3,
            limited_transmit: true,
            initial_sequence: 0,
            congestion: CongestionAlgorithm::NewReno,
        }
    }
}

/// Behaviour of the simulated link between every pair of nodes.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// One-way propagation delay.
    pub delay: Duration,
    /// Serialisation rate in bytes per second (`None` = unlimited).
    pub bandwidth: Option<u64>,
    /// Probability that any given segment is silently dropped.
    pub loss_rate: f64,
    /// Probability that a bit of the segment is flipped in transit.
    pub corrupt_rate: f64,
    /// Seed for the fault RNG so runs are reproducible.
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        // No faults by default: the link is a plain delay line.
        Self {
            delay: Duration::from_millis(10),
            bandwidth: None,
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 1,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Worker threads available to asynchronous jobs.
    pub workers: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}
