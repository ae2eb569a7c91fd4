//! The seam between a socket and the protocol engine behind it.
//!
//! [`crate::socket::TcpSocket`] is a thin, thread-safe handle.  Everything
//! protocol-specific sits behind [`TcpImplementation`], which the socket
//! keeps under a lock and calls with `&mut self`.  The engine never calls
//! back into application code while it is locked: it queues
//! [`Notification`]s instead, and the socket delivers them once the lock is
//! released.
//!
//! Timers work the same way in reverse.  The engine schedules a closure that
//! holds a [`SocketRef`](crate::socket::SocketRef); when it fires, the socket
//! locks the engine and calls [`TcpImplementation::on_timer`].

use std::net::SocketAddr;

use crate::config::TcpConfig;
use crate::endpoint::Icmp;
use crate::error::SocketErrno;
use crate::packet::Segment;
use crate::socket::{SocketId, SocketRef};
use crate::state::TcpState;
use crate::tcb::TcpSocketState;
use crate::trace::TcpTraces;

/// Timers an engine can arm.  At most one of each kind is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Data retransmission timeout.
    Retransmit,
    /// Re-send a control segment (SYN, SYN-ACK or FIN) with these flags.
    ResendControl(u8),
    DelayedAck,
    /// Zero-window probe.
    Persist,
    /// 2·MSL elapsed in TIME_WAIT.
    TimeWait,
    /// No ACK for our FIN while in LAST_ACK.
    LastAck,
    /// Deferred transmission of freshly queued data.
    SendPending,
}

/// Application-visible events, delivered after the engine lock is released.
#[derive(Debug, Clone)]
pub enum Notification {
    ConnectionSucceeded,
    ConnectionFailed,
    /// A listener received a SYN; the socket layer decides whether to fork.
    ForkRequest {
        segment: Segment,
        from: SocketAddr,
        to: SocketAddr,
    },
    /// A forked socket completed its handshake.
    NewConnectionCreated { from: SocketAddr },
    /// Bytes sent for the first time.
    DataSent(u32),
    /// Free space in the send buffer.
    SendSpace(u32),
    DataReceived,
    NormalClose,
    ErrorClose,
    Icmp(Icmp),
}

/// Options agreed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedOptions {
    pub sack: bool,
    pub timestamp: bool,
    /// `(send shift, receive shift)` when window scaling is in use.
    pub window_scale: Option<(u8, u8)>,
}

/// A TCP protocol engine.
pub trait TcpImplementation: Send {
    fn id(&self) -> SocketId;

    fn state(&self) -> TcpState;

    /// Last synchronous error, if any.
    fn errno(&self) -> Option<SocketErrno>;

    fn config(&self) -> &TcpConfig;

    /// Replace the configuration.  Only allowed in CLOSED.
    fn reconfigure(&mut self, config: TcpConfig) -> Result<(), SocketErrno>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn negotiated(&self) -> NegotiatedOptions;

    fn tcb(&self) -> &TcpSocketState;

    fn tcb_mut(&mut self) -> &mut TcpSocketState;

    fn traces(&self) -> &TcpTraces;

    fn traces_mut(&mut self) -> &mut TcpTraces;

    // -----------------------------------------------------------------------
    // Application calls
    // -----------------------------------------------------------------------

    /// Bind to `local`, or to an ephemeral port when `None`.
    fn bind(&mut self, local: Option<SocketAddr>) -> Result<(), SocketErrno>;

    fn connect(&mut self, peer: SocketAddr) -> Result<(), SocketErrno>;

    fn listen(&mut self) -> Result<(), SocketErrno>;

    /// Queue `data`; returns the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, SocketErrno>;

    /// `None` when nothing is readable; an empty buffer at end of stream.
    fn recv(&mut self, max: u32) -> Option<Vec<u8>>;

    fn close(&mut self) -> Result<(), SocketErrno>;

    fn shutdown_send(&mut self) -> Result<(), SocketErrno>;

    fn shutdown_recv(&mut self) -> Result<(), SocketErrno>;

    /// Free space in the send buffer.
    fn tx_available(&self) -> u32;

    /// Bytes ready to be read.
    fn rx_available(&self) -> u32;

    // -----------------------------------------------------------------------
    // Network and timer input
    // -----------------------------------------------------------------------

    fn on_segment(&mut self, segment: Segment, from: SocketAddr, to: SocketAddr);

    fn on_icmp(&mut self, icmp: Icmp);

    fn on_timer(&mut self, timer: Timer);

    /// The network tore the endpoint down.
    fn on_endpoint_destroyed(&mut self);

    // -----------------------------------------------------------------------
    // Passive open
    // -----------------------------------------------------------------------

    /// Clone a listener for a new connection owned by `owner`.
    fn fork(&self, id: SocketId, owner: SocketRef) -> Box<dyn TcpImplementation>;

    /// Finish a fork: bind the four-tuple, answer the SYN with a SYN-ACK.
    fn complete_fork(&mut self, syn: Segment, from: SocketAddr, to: SocketAddr);

    /// Drain queued notifications.
    fn take_notifications(&mut self) -> Vec<Notification>;
}
