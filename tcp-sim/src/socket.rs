//! Application-facing socket handles.
//!
//! [`TcpSocket`] is a cheap, cloneable handle around a locked
//! [`TcpImplementation`].  Application calls, incoming segments and timer
//! expiries all enter through [`TcpSocket::with_imp`], which runs the engine
//! under the lock and then delivers whatever [`Notification`]s it queued.
//! Callbacks therefore always run unlocked and may call back into the socket.
//!
//! ```text
//!  app ──call──▶ TcpSocket ──lock──▶ Connection ──queue──▶ notifications
//!                    ▲                                         │
//!                    └──────── callbacks (unlocked) ◀──────────┘
//! ```
//!
//! The network holds strong handles through the endpoint callbacks, so a
//! socket lives at least as long as its endpoint.  Timers hold a weak
//! [`SocketRef`] and become no-ops once the socket is gone.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::TcpConfig;
use crate::connection::Connection;
use crate::endpoint::{Icmp, L4Protocol, NodeId};
use crate::error::SocketErrno;
use crate::implementation::{NegotiatedOptions, Notification, TcpImplementation, Timer};
use crate::network::Network;
use crate::packet::Segment;
use crate::simulator::SimHandle;
use crate::state::TcpState;
use crate::tcb::TcpSocketState;
use crate::trace::TcpTraces;

/// Process-wide socket identifier, used in logs and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u64);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    pub fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub type SocketCallback = Arc<dyn Fn(&TcpSocket) + Send + Sync>;
/// Return `false` to refuse the connection from the given peer.
pub type ConnectionRequestCallback = Arc<dyn Fn(&TcpSocket, SocketAddr) -> bool + Send + Sync>;
/// Receives the new connected socket and its peer.
pub type NewConnectionCallback = Arc<dyn Fn(&TcpSocket, SocketAddr) + Send + Sync>;
/// Byte counts: newly sent data, or free send-buffer space.
pub type BytesCallback = Arc<dyn Fn(&TcpSocket, u32) + Send + Sync>;
pub type IcmpCallback = Arc<dyn Fn(&TcpSocket, Icmp) + Send + Sync>;

#[derive(Clone, Default)]
struct SocketCallbacks {
    connection_succeeded: Option<SocketCallback>,
    connection_failed: Option<SocketCallback>,
    connection_request: Option<ConnectionRequestCallback>,
    new_connection: Option<NewConnectionCallback>,
    normal_close: Option<SocketCallback>,
    error_close: Option<SocketCallback>,
    data_sent: Option<BytesCallback>,
    send: Option<BytesCallback>,
    recv: Option<SocketCallback>,
    icmp: Option<IcmpCallback>,
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

struct SocketShared {
    id: SocketId,
    imp: Mutex<Box<dyn TcpImplementation>>,
    callbacks: Mutex<SocketCallbacks>,
}

/// A TCP socket.
#[derive(Clone)]
pub struct TcpSocket(Arc<SocketShared>);

/// Weak handle used by timers and by the engine to reach its socket.
#[derive(Clone)]
pub struct SocketRef(Weak<SocketShared>);

impl SocketRef {
    pub fn upgrade(&self) -> Option<TcpSocket> {
        self.0.upgrade().map(TcpSocket)
    }

    /// Deliver a timer expiry, unless the socket is gone.
    pub fn fire(&self, timer: Timer) {
        match self.upgrade() {
            Some(socket) => socket.with_imp(|imp| imp.on_timer(timer)),
            None => log::trace!("[tcp] timer {timer:?} for a dropped socket"),
        }
    }
}

impl fmt::Debug for SocketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.upgrade() {
            Some(shared) => write!(f, "SocketRef({})", shared.id),
            None => write!(f, "SocketRef(<dropped>)"),
        }
    }
}

impl TcpSocket {
    /// A CLOSED socket on `node` of `net`.
    pub fn new(net: &Arc<Network>, node: NodeId, config: TcpConfig) -> Self {
        let l4: Arc<dyn L4Protocol> = Arc::clone(net) as Arc<dyn L4Protocol>;
        Self::with_protocol(l4, net.sim().clone(), node, config)
    }

    /// A CLOSED socket on any [`L4Protocol`].
    pub fn with_protocol(
        l4: Arc<dyn L4Protocol>,
        sim: SimHandle,
        node: NodeId,
        config: TcpConfig,
    ) -> Self {
        let id = SocketId::next();
        let shared = Arc::new_cyclic(|weak| {
            let owner = SocketRef(weak.clone());
            let imp: Box<dyn TcpImplementation> =
                Box::new(Connection::new(id, owner, sim, l4, node, config));
            SocketShared {
                id,
                imp: Mutex::new(imp),
                callbacks: Mutex::new(SocketCallbacks::default()),
            }
        });
        log::trace!("[tcp {id}] socket created on node {node}");
        TcpSocket(shared)
    }

    pub fn id(&self) -> SocketId {
        self.0.id
    }

    pub fn downgrade(&self) -> SocketRef {
        SocketRef(Arc::downgrade(&self.0))
    }

    /// Run `f` on the engine, then deliver the notifications it queued.
    fn with_imp<R>(&self, f: impl FnOnce(&mut dyn TcpImplementation) -> R) -> R {
        let (result, notifications) = {
            let mut imp = self.0.imp.lock();
            let result = f(imp.as_mut());
            (result, imp.take_notifications())
        };
        for notification in notifications {
            self.dispatch(notification);
        }
        result
    }

    fn callbacks(&self) -> SocketCallbacks {
        self.0.callbacks.lock().clone()
    }

    fn dispatch(&self, notification: Notification) {
        let cbs = self.callbacks();
        match notification {
            Notification::ConnectionSucceeded => {
                if let Some(cb) = cbs.connection_succeeded {
                    cb(self);
                }
            }
            Notification::ConnectionFailed => {
                if let Some(cb) = cbs.connection_failed {
                    cb(self);
                }
            }
            Notification::ForkRequest { segment, from, to } => {
                let accept = cbs.connection_request.map_or(true, |cb| cb(self, from));
                if accept {
                    self.fork(segment, from, to);
                } else {
                    log::debug!("[tcp {}] refused connection from {from}", self.id());
                }
            }
            Notification::NewConnectionCreated { from } => {
                if let Some(cb) = cbs.new_connection {
                    cb(self, from);
                }
            }
            Notification::DataSent(bytes) => {
                if let Some(cb) = cbs.data_sent {
                    cb(self, bytes);
                }
            }
            Notification::SendSpace(space) => {
                if let Some(cb) = cbs.send {
                    cb(self, space);
                }
            }
            Notification::DataReceived => {
                if let Some(cb) = cbs.recv {
                    cb(self);
                }
            }
            Notification::NormalClose => {
                if let Some(cb) = cbs.normal_close {
                    cb(self);
                }
            }
            Notification::ErrorClose => {
                if let Some(cb) = cbs.error_close {
                    cb(self);
                }
            }
            Notification::Icmp(icmp) => {
                if let Some(cb) = cbs.icmp {
                    cb(self, icmp);
                }
            }
        }
    }

    /// Clone this listener for a new connection and answer the SYN.
    fn fork(&self, syn: Segment, from: SocketAddr, to: SocketAddr) {
        let id = SocketId::next();
        let callbacks = self.callbacks();
        let shared = Arc::new_cyclic(|weak| {
            let imp = self.0.imp.lock().fork(id, SocketRef(weak.clone()));
            SocketShared {
                id,
                imp: Mutex::new(imp),
                callbacks: Mutex::new(callbacks),
            }
        });
        let child = TcpSocket(shared);
        log::debug!("[tcp {}] forked {} for {from}", self.id(), child.id());
        child.with_imp(|imp| imp.complete_fork(syn, from, to));
    }

    // -----------------------------------------------------------------------
    // Network side
    // -----------------------------------------------------------------------

    pub(crate) fn forward_up(&self, segment: Segment, from: SocketAddr, to: SocketAddr) {
        self.with_imp(|imp| imp.on_segment(segment, from, to));
    }

    pub(crate) fn forward_icmp(&self, icmp: Icmp) {
        self.with_imp(|imp| imp.on_icmp(icmp));
    }

    pub(crate) fn endpoint_destroyed(&self) {
        self.with_imp(|imp| imp.on_endpoint_destroyed());
    }

    // -----------------------------------------------------------------------
    // Application calls
    // -----------------------------------------------------------------------

    /// Bind to `local`, or to an ephemeral port on any address.
    pub fn bind(&self, local: Option<SocketAddr>) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.bind(local))
    }

    pub fn connect(&self, peer: SocketAddr) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.connect(peer))
    }

    pub fn listen(&self) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.listen())
    }

    /// Queue `data` for sending.  All of it is accepted or none.
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketErrno> {
        self.with_imp(|imp| imp.send(data))
    }

    /// Read up to `max` bytes.  `None` when nothing is available, an empty
    /// buffer once the peer has closed.
    pub fn recv(&self, max: u32) -> Option<Vec<u8>> {
        self.with_imp(|imp| imp.recv(max))
    }

    pub fn close(&self) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.close())
    }

    pub fn shutdown_send(&self) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.shutdown_send())
    }

    pub fn shutdown_recv(&self) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.shutdown_recv())
    }

    pub fn reconfigure(&self, config: TcpConfig) -> Result<(), SocketErrno> {
        self.with_imp(|imp| imp.reconfigure(config))
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn errno(&self) -> Option<SocketErrno> {
        self.0.imp.lock().errno()
    }

    pub fn state(&self) -> TcpState {
        self.0.imp.lock().state()
    }

    pub fn config(&self) -> TcpConfig {
        self.0.imp.lock().config().clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.0.imp.lock().local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.imp.lock().peer_addr()
    }

    pub fn negotiated(&self) -> NegotiatedOptions {
        self.0.imp.lock().negotiated()
    }

    pub fn tx_available(&self) -> u32 {
        self.0.imp.lock().tx_available()
    }

    pub fn rx_available(&self) -> u32 {
        self.0.imp.lock().rx_available()
    }

    pub fn cwnd(&self) -> u32 {
        self.0.imp.lock().tcb().cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.0.imp.lock().tcb().ssthresh()
    }

    /// Access the trace sources, e.g. to connect a sink.  Sinks run with the
    /// socket locked and must not call back into it.
    pub fn with_traces<R>(&self, f: impl FnOnce(&mut TcpTraces) -> R) -> R {
        f(self.0.imp.lock().traces_mut())
    }

    /// Access the TCB, e.g. to trace cwnd.  Same locking caveat as
    /// [`TcpSocket::with_traces`].
    pub fn with_tcb<R>(&self, f: impl FnOnce(&mut TcpSocketState) -> R) -> R {
        f(self.0.imp.lock().tcb_mut())
    }

    // -----------------------------------------------------------------------
    // Callback registration
    // -----------------------------------------------------------------------

    pub fn set_connect_callback(
        &self,
        succeeded: impl Fn(&TcpSocket) + Send + Sync + 'static,
        failed: impl Fn(&TcpSocket) + Send + Sync + 'static,
    ) {
        let mut cbs = self.0.callbacks.lock();
        cbs.connection_succeeded = Some(Arc::new(succeeded));
        cbs.connection_failed = Some(Arc::new(failed));
    }

    /// `request` may refuse a peer; `created` receives each new connection.
    pub fn set_accept_callback(
        &self,
        request: impl Fn(&TcpSocket, SocketAddr) -> bool + Send + Sync + 'static,
        created: impl Fn(&TcpSocket, SocketAddr) + Send + Sync + 'static,
    ) {
        let mut cbs = self.0.callbacks.lock();
        cbs.connection_request = Some(Arc::new(request));
        cbs.new_connection = Some(Arc::new(created));
    }

    pub fn set_close_callbacks(
        &self,
        normal: impl Fn(&TcpSocket) + Send + Sync + 'static,
        error: impl Fn(&TcpSocket) + Send + Sync + 'static,
    ) {
        let mut cbs = self.0.callbacks.lock();
        cbs.normal_close = Some(Arc::new(normal));
        cbs.error_close = Some(Arc::new(error));
    }

    pub fn set_data_sent_callback(&self, cb: impl Fn(&TcpSocket, u32) + Send + Sync + 'static) {
        self.0.callbacks.lock().data_sent = Some(Arc::new(cb));
    }

    pub fn set_send_callback(&self, cb: impl Fn(&TcpSocket, u32) + Send + Sync + 'static) {
        self.0.callbacks.lock().send = Some(Arc::new(cb));
    }

    pub fn set_recv_callback(&self, cb: impl Fn(&TcpSocket) + Send + Sync + 'static) {
        self.0.callbacks.lock().recv = Some(Arc::new(cb));
    }

    pub fn set_icmp_callback(&self, cb: impl Fn(&TcpSocket, Icmp) + Send + Sync + 'static) {
        self.0.callbacks.lock().icmp = Some(Arc::new(cb));
    }
}

impl PartialEq for TcpSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TcpSocket {}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket").field("id", &self.0.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, SimulatorConfig};
    use crate::simulator::Simulator;
    use std::net::IpAddr;

    fn setup() -> (Simulator, Arc<Network>, NodeId) {
        let sim = Simulator::new(SimulatorConfig { workers: 0 }).expect("simulator");
        let net = Network::new(sim.handle(), LinkConfig::default());
        let node = net.add_node("10.0.0.1".parse::<IpAddr>().expect("ip"));
        (sim, net, node)
    }

    #[test]
    fn ids_are_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn new_socket_is_closed_and_unbound() {
        let (_sim, net, node) = setup();
        let s = TcpSocket::new(&net, node, TcpConfig::default());
        assert_eq!(s.state(), TcpState::Closed);
        assert_eq!(s.local_addr(), None);
        assert_eq!(s.errno(), None);
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let (_sim, net, node) = setup();
        let s = TcpSocket::new(&net, node, TcpConfig::default());
        assert_eq!(s.send(b"hello"), Err(SocketErrno::NotConn));
        assert_eq!(s.errno(), Some(SocketErrno::NotConn));
    }

    #[test]
    fn double_bind_is_invalid() {
        let (_sim, net, node) = setup();
        let s = TcpSocket::new(&net, node, TcpConfig::default());
        s.bind(None).expect("first bind");
        assert!(s.local_addr().is_some());
        assert_eq!(s.bind(None), Err(SocketErrno::Inval));
    }

    #[test]
    fn listen_twice_is_invalid() {
        let (_sim, net, node) = setup();
        let s = TcpSocket::new(&net, node, TcpConfig::default());
        s.listen().expect("listen");
        assert_eq!(s.state(), TcpState::Listen);
        assert_eq!(s.listen(), Err(SocketErrno::Inval));
    }

    #[test]
    fn segment_size_is_fixed_outside_closed() {
        let (_sim, net, node) = setup();
        let s = TcpSocket::new(&net, node, TcpConfig::default());
        let bigger = TcpConfig {
            segment_size: 1000,
            ..TcpConfig::default()
        };
        s.reconfigure(bigger.clone()).expect("closed socket accepts");
        assert_eq!(s.config().segment_size, 1000);
        s.listen().expect("listen");
        let smaller = TcpConfig {
            segment_size: 500,
            ..bigger
        };
        assert_eq!(s.reconfigure(smaller), Err(SocketErrno::Inval));
    }
}
