//! Connection and congestion finite-state machine types.
//!
//! Two independent axes describe a connection:
//! - [`TcpState`]: the RFC 793 connection automaton.
//! - [`CongState`]: the sender's loss-recovery sub-state.
//!
//! Transitions live in [`crate::connection`] and [`crate::input`]; this
//! module only names the states.
//!
//! ```text
//!  CLOSED ──connect──▶ SYN_SENT ──SYN-ACK──▶ ESTABLISHED ──close──▶ FIN_WAIT_1
//!    │                    │                     │                      │
//!  listen              SYN (simultaneous)     FIN rcvd              ACK │ FIN rcvd
//!    ▼                    ▼                     ▼                      ▼      ▼
//!  LISTEN ──SYN──▶ SYN_RCVD ──ACK──▶ …      CLOSE_WAIT           FIN_WAIT_2  CLOSING
//!                                               │ close                │      │ ACK
//!                                               ▼                      ▼      ▼
//!                                            LAST_ACK ──ACK──▶ CLOSED  TIME_WAIT ──2·MSL──▶ CLOSED
//! ```

use std::fmt;

/// All possible states of the connection FSM.
///
/// The declaration order matters: every state from [`TcpState::CloseWait`]
/// onwards means the peer or the application has started closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    /// No connection exists; initial and final state.
    Closed,
    /// Waiting for a SYN from any peer.
    Listen,
    /// SYN sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received and SYN-ACK sent; waiting for ACK.
    SynRcvd,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Peer's FIN received; waiting for the application to close.
    CloseWait,
    /// FIN sent after CLOSE_WAIT; waiting for its ACK.
    LastAck,
    /// Local FIN sent; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Both sides sent FIN simultaneously; waiting for our FIN's ACK.
    Closing,
    /// Waiting 2·MSL for stray segments to drain.
    TimeWait,
}

impl TcpState {
    /// `true` once a SYN has been exchanged in both directions.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::Listen | TcpState::SynSent)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Loss-recovery sub-state of the sender.
///
/// ```text
///  OPEN ──dupack──▶ DISORDER ──dupthresh──▶ RECOVERY ──full ACK──▶ OPEN
///    │
///    └────────────── RTO (from any) ──▶ LOSS ──ACK ≥ recover──▶ OPEN
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CongState {
    /// Normal operation.
    #[default]
    Open,
    /// Duplicate ACKs or SACKs seen, not yet enough to call a loss.
    Disorder,
    /// Congestion window reduced by an ECN signal (never entered here).
    Cwr,
    /// Fast retransmit / fast recovery in progress.
    Recovery,
    /// Retransmission timeout fired.
    Loss,
}

impl fmt::Display for CongState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CongState::Open => "CA_OPEN",
            CongState::Disorder => "CA_DISORDER",
            CongState::Cwr => "CA_CWR",
            CongState::Recovery => "CA_RECOVERY",
            CongState::Loss => "CA_LOSS",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_states_sort_after_established() {
        assert!(TcpState::CloseWait > TcpState::Established);
        assert!(TcpState::TimeWait > TcpState::FinWait1);
        assert!(TcpState::SynRcvd < TcpState::Established);
    }

    #[test]
    fn display_uses_canonical_names() {
        assert_eq!(TcpState::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(CongState::Recovery.to_string(), "CA_RECOVERY");
    }

    #[test]
    fn synchronized_states() {
        assert!(!TcpState::SynSent.is_synchronized());
        assert!(TcpState::SynRcvd.is_synchronized());
        assert!(TcpState::TimeWait.is_synchronized());
    }
}
