//! Simulated network.
//!
//! Every node owns one address.  All nodes share the same point-to-point
//! link model, applied per direction:
//!
//! ```text
//!  send_packet ──▶ drop filter ──▶ encode ──▶ loss? ──▶ corrupt? ──▶ queue ──▶ delay ──▶ deliver
//!                                                                   (bandwidth)          (dst context)
//! ```
//!
//! Delivery decodes the bytes again (so corruption is caught by the
//! checksum) and demultiplexes by exact four-tuple first, then by
//! listener.  A segment nobody claims is answered with an RST.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::LinkConfig;
use crate::endpoint::{
    Endpoint, EndpointCallbacks, EndpointId, Icmp, L4Protocol, NodeId,
};
use crate::error::SocketErrno;
use crate::packet::{flags, Segment, TcpHeader};
use crate::simulator::SimHandle;

/// First port handed out when a socket binds without one.
const EPHEMERAL_PORT_START: u16 = 49_152;

/// Returns `true` for segments that should vanish in transit.
pub type DropFilter = Box<dyn FnMut(&TcpHeader, &[u8]) -> bool + Send>;

/// Counters kept by the link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub lost: u64,
    pub corrupted: u64,
    pub filtered: u64,
    pub delivered: u64,
    /// Delivered segments no endpoint claimed.
    pub unmatched: u64,
}

struct Node {
    addr: IpAddr,
    next_port: u16,
}

struct Entry {
    endpoint: Endpoint,
    callbacks: EndpointCallbacks,
}

struct NetworkInner {
    nodes: Vec<Node>,
    endpoints: BTreeMap<EndpointId, Entry>,
    next_endpoint: EndpointId,
    rng: StdRng,
    /// Per `(from, to)` direction: when the transmitter becomes idle.
    busy_until: HashMap<(NodeId, NodeId), Duration>,
    drop_filter: Option<DropFilter>,
    stats: LinkStats,
}

impl NetworkInner {
    fn node_of(&self, ip: IpAddr) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.addr == ip)
            .and_then(|i| NodeId::try_from(i).ok())
    }

    fn node(&mut self, node: NodeId) -> Result<&mut Node, SocketErrno> {
        self.nodes
            .get_mut(node as usize)
            .ok_or(SocketErrno::AddrNotAvail)
    }

    fn port_in_use(&self, node: NodeId, local: SocketAddr, peer: Option<SocketAddr>) -> bool {
        self.endpoints.values().any(|e| {
            let ep = &e.endpoint;
            ep.node == node
                && ep.local.port() == local.port()
                && ep.peer == peer
                && (ep.local.ip() == local.ip()
                    || ep.local.ip().is_unspecified()
                    || local.ip().is_unspecified())
        })
    }

    fn ephemeral_port(&mut self, node: NodeId) -> Result<u16, SocketErrno> {
        let start = self.node(node)?.next_port;
        let mut port = start;
        loop {
            let candidate = port;
            port = if port == u16::MAX { EPHEMERAL_PORT_START } else { port + 1 };
            let busy = self
                .endpoints
                .values()
                .any(|e| e.endpoint.node == node && e.endpoint.local.port() == candidate);
            if !busy {
                self.node(node)?.next_port = port;
                return Ok(candidate);
            }
            if port == start {
                return Err(SocketErrno::AddrNotAvail);
            }
        }
    }

    fn insert(&mut self, node: NodeId, local: SocketAddr, peer: Option<SocketAddr>) -> Endpoint {
        let id = self.next_endpoint;
        self.next_endpoint += 1;
        let endpoint = Endpoint { id, node, local, peer };
        self.endpoints.insert(
            id,
            Entry {
                endpoint: endpoint.clone(),
                callbacks: EndpointCallbacks::default(),
            },
        );
        endpoint
    }

    /// Exact four-tuple first, then a listener on the port.
    fn lookup(&self, node: NodeId, from: SocketAddr, to: SocketAddr) -> Option<&Entry> {
        let candidates = || {
            self.endpoints
                .values()
                .filter(move |e| e.endpoint.node == node && e.endpoint.matches(from, to))
        };
        candidates()
            .find(|e| e.endpoint.peer.is_some())
            .or_else(|| candidates().find(|e| e.endpoint.peer.is_none()))
    }
}

/// The shared medium every socket sends through.
pub struct Network {
    sim: SimHandle,
    link: LinkConfig,
    inner: Mutex<NetworkInner>,
    me: Weak<Network>,
}

impl Network {
    pub fn new(sim: SimHandle, link: LinkConfig) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(link.seed);
        Arc::new_cyclic(|me| Network {
            sim,
            link,
            inner: Mutex::new(NetworkInner {
                nodes: Vec::new(),
                endpoints: BTreeMap::new(),
                next_endpoint: 1,
                rng,
                busy_until: HashMap::new(),
                drop_filter: None,
                stats: LinkStats::default(),
            }),
            me: me.clone(),
        })
    }

    pub fn sim(&self) -> &SimHandle {
        &self.sim
    }

    pub fn link(&self) -> &LinkConfig {
        &self.link
    }

    /// Add a node owning `addr`.
    pub fn add_node(&self, addr: IpAddr) -> NodeId {
        let mut inner = self.inner.lock();
        assert!(
            inner.node_of(addr).is_none(),
            "address {addr} is already assigned to a node"
        );
        inner.nodes.push(Node {
            addr,
            next_port: EPHEMERAL_PORT_START,
        });
        let id = NodeId::try_from(inner.nodes.len() - 1)
            .unwrap_or_else(|_| panic!("too many nodes"));
        log::debug!("[net] node {id} has address {addr}");
        id
    }

    pub fn node_address(&self, node: NodeId) -> Option<IpAddr> {
        self.inner.lock().nodes.get(node as usize).map(|n| n.addr)
    }

    /// Install a filter that silently drops chosen segments.
    pub fn set_drop_filter(&self, filter: impl FnMut(&TcpHeader, &[u8]) -> bool + Send + 'static) {
        self.inner.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.lock().drop_filter = None;
    }

    pub fn stats(&self) -> LinkStats {
        self.inner.lock().stats
    }

    /// Number of allocated endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Report an ICMP error to the endpoint bound to `local <-> peer`.
    pub fn send_icmp(&self, local: SocketAddr, peer: SocketAddr, icmp: Icmp) {
        let callback = {
            let inner = self.inner.lock();
            let Some(node) = inner.node_of(local.ip()) else {
                return;
            };
            inner
                .lookup(node, peer, local)
                .and_then(|e| e.callbacks.icmp.clone())
        };
        match callback {
            Some(cb) => cb(icmp),
            None => log::debug!("[net] ICMP for {local} <-> {peer} has no receiver"),
        }
    }

    /// Tear down every endpoint, invoking each destroy callback.
    pub fn destroy(&self) {
        let callbacks: Vec<_> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.endpoints)
                .into_values()
                .filter_map(|e| e.callbacks.destroy)
                .collect()
        };
        log::debug!("[net] destroying, {} endpoints notified", callbacks.len());
        for cb in callbacks {
            cb();
        }
    }

    fn deliver(&self, bytes: Vec<u8>, node: NodeId, from: SocketAddr, to: SocketAddr) {
        let segment = match Segment::decode(&bytes) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[net] dropping undecodable segment {from} -> {to}: {e}");
                return;
            }
        };
        let callback = {
            let mut inner = self.inner.lock();
            inner.stats.delivered += 1;
            let cb = inner.lookup(node, from, to).and_then(|e| e.callbacks.rx.clone());
            if cb.is_none() {
                inner.stats.unmatched += 1;
            }
            cb
        };
        match callback {
            Some(cb) => cb(segment, from, to),
            None => self.refuse(&segment, from, to),
        }
    }

    /// Answer a segment nobody claimed with an RST.
    fn refuse(&self, segment: &Segment, from: SocketAddr, to: SocketAddr) {
        let h = &segment.header;
        log::debug!("[net] no endpoint for {from} -> {to} ({h})");
        if h.has_flag(flags::RST) {
            return;
        }
        let mut rst = TcpHeader {
            source_port: to.port(),
            destination_port: from.port(),
            ..TcpHeader::default()
        };
        if h.has_flag(flags::ACK) {
            rst.flags = flags::RST;
            rst.seq = h.ack;
        } else {
            let mut len = segment.payload.len() as u32;
            if h.has_flag(flags::SYN) {
                len += 1;
            }
            if h.has_flag(flags::FIN) {
                len += 1;
            }
            rst.flags = flags::RST | flags::ACK;
            rst.ack = h.seq + len;
        }
        self.send_packet(Segment::new(rst, Vec::new()), to, from);
    }
}

impl L4Protocol for Network {
    fn allocate(&self, node: NodeId, local: Option<SocketAddr>) -> Result<Endpoint, SocketErrno> {
        let mut inner = self.inner.lock();
        let node_addr = inner.node(node)?.addr;
        let mut local = local.unwrap_or_else(|| {
            let any = match node_addr {
                IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            };
            SocketAddr::new(any, 0)
        });
        if !local.ip().is_unspecified() && local.ip() != node_addr {
            return Err(SocketErrno::AddrNotAvail);
        }
        if local.port() == 0 {
            local.set_port(inner.ephemeral_port(node)?);
        } else if inner.port_in_use(node, local, None) {
            return Err(SocketErrno::AddrInUse);
        }
        let ep = inner.insert(node, local, None);
        log::trace!("[net] allocated endpoint {} at {}", ep.id, ep);
        Ok(ep)
    }

    fn allocate_full(
        &self,
        node: NodeId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Endpoint, SocketErrno> {
        let mut inner = self.inner.lock();
        if inner.node(node)?.addr != local.ip() {
            return Err(SocketErrno::AddrNotAvail);
        }
        if inner.port_in_use(node, local, Some(peer)) {
            return Err(SocketErrno::AddrInUse);
        }
        let ep = inner.insert(node, local, Some(peer));
        log::trace!("[net] allocated endpoint {} at {}", ep.id, ep);
        Ok(ep)
    }

    fn connect_endpoint(
        &self,
        id: EndpointId,
        local_ip: IpAddr,
        peer: SocketAddr,
    ) -> Result<Endpoint, SocketErrno> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.endpoints.get(&id) else {
            return Err(SocketErrno::Inval);
        };
        let node = entry.endpoint.node;
        let local = SocketAddr::new(local_ip, entry.endpoint.local.port());
        let taken = inner.endpoints.values().any(|e| {
            e.endpoint.id != id
                && e.endpoint.node == node
                && e.endpoint.local == local
                && e.endpoint.peer == Some(peer)
        });
        if taken {
            return Err(SocketErrno::AddrInUse);
        }
        let Some(entry) = inner.endpoints.get_mut(&id) else {
            return Err(SocketErrno::Inval);
        };
        entry.endpoint.local = local;
        entry.endpoint.peer = Some(peer);
        Ok(entry.endpoint.clone())
    }

    fn set_callbacks(&self, id: EndpointId, callbacks: EndpointCallbacks) {
        if let Some(entry) = self.inner.lock().endpoints.get_mut(&id) {
            entry.callbacks = callbacks;
        }
    }

    fn deallocate(&self, id: EndpointId) {
        // Dropped outside the lock: callbacks may own sockets.
        let removed = self.inner.lock().endpoints.remove(&id);
        if let Some(entry) = removed {
            log::trace!("[net] released endpoint {} at {}", id, entry.endpoint);
        }
    }

    fn route_output(&self, node: NodeId, dst: IpAddr) -> Result<IpAddr, SocketErrno> {
        let inner = self.inner.lock();
        let src = inner
            .nodes
            .get(node as usize)
            .map(|n| n.addr)
            .ok_or(SocketErrno::AddrNotAvail)?;
        if src.is_ipv4() != dst.is_ipv4() || inner.node_of(dst).is_none() {
            return Err(SocketErrno::NoRouteToHost);
        }
        Ok(src)
    }

    fn send_packet(&self, segment: Segment, src: SocketAddr, dst: SocketAddr) {
        let now = self.sim.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (Some(from), Some(to)) = (inner.node_of(src.ip()), inner.node_of(dst.ip())) else {
            log::debug!("[net] no route {src} -> {dst}, segment dropped");
            return;
        };
        inner.stats.sent += 1;

        if let Some(filter) = inner.drop_filter.as_mut() {
            if filter(&segment.header, &segment.payload) {
                inner.stats.filtered += 1;
                log::trace!("[net] filtered {}", segment.header);
                return;
            }
        }

        let mut bytes = segment.encode();
        if self.link.loss_rate > 0.0 && inner.rng.gen::<f64>() < self.link.loss_rate {
            inner.stats.lost += 1;
            log::trace!("[net] lost {}", segment.header);
            return;
        }
        if self.link.corrupt_rate > 0.0 && inner.rng.gen::<f64>() < self.link.corrupt_rate {
            let idx = inner.rng.gen_range(0..bytes.len());
            let bit = inner.rng.gen_range(0..8);
            bytes[idx] ^= 1 << bit;
            inner.stats.corrupted += 1;
        }

        let tx_time = self.link.bandwidth.map_or(Duration::ZERO, |bw| {
            Duration::from_nanos(bytes.len() as u64 * 1_000_000_000 / bw.max(1))
        });
        let busy = inner.busy_until.entry((from, to)).or_insert(now);
        let start = (*busy).max(now);
        *busy = start + tx_time;
        let arrival = *busy + self.link.delay;
        drop(guard);

        let Some(net) = self.me.upgrade() else {
            return;
        };
        log::trace!("[net] {src} -> {dst} {} len={} at {:?}", segment.header, segment.payload.len(), arrival);
        self.sim
            .schedule_with_context(to, arrival - now, move || net.deliver(bytes, to, src, dst));
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Network")
            .field("nodes", &inner.nodes.len())
            .field("endpoints", &inner.endpoints.len())
            .field("stats", &inner.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::seq::SequenceNumber;
    use crate::simulator::Simulator;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn setup() -> (Simulator, Arc<Network>, NodeId, NodeId) {
        let sim = Simulator::new(SimulatorConfig { workers: 0 }).unwrap();
        let net = Network::new(sim.handle(), LinkConfig::default());
        let a = net.add_node("10.0.0.1".parse().unwrap());
        let b = net.add_node("10.0.0.2".parse().unwrap());
        (sim, net, a, b)
    }

    #[test]
    fn ephemeral_ports_are_distinct() {
        let (_sim, net, a, _) = setup();
        let e1 = net.allocate(a, None).unwrap();
        let e2 = net.allocate(a, None).unwrap();
        assert_ne!(e1.local.port(), e2.local.port());
        assert!(e1.local.port() >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn duplicate_bind_is_refused() {
        let (_sim, net, a, _) = setup();
        net.allocate(a, Some(addr("10.0.0.1:80"))).unwrap();
        assert_eq!(
            net.allocate(a, Some(addr("0.0.0.0:80"))),
            Err(SocketErrno::AddrInUse)
        );
        assert_eq!(
            net.allocate(a, Some(addr("10.9.9.9:81"))),
            Err(SocketErrno::AddrNotAvail)
        );
    }

    #[test]
    fn route_needs_a_known_destination() {
        let (_sim, net, a, _) = setup();
        assert_eq!(net.route_output(a, "10.0.0.2".parse().unwrap()), Ok("10.0.0.1".parse().unwrap()));
        assert_eq!(
            net.route_output(a, "192.168.1.1".parse().unwrap()),
            Err(SocketErrno::NoRouteToHost)
        );
    }

    #[test]
    fn delivery_reaches_the_bound_endpoint_after_the_delay() {
        let (mut sim, net, _a, b) = setup();
        let ep = net.allocate(b, Some(addr("10.0.0.2:80"))).unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        let clock = sim.handle().clock();
        net.set_callbacks(
            ep.id,
            EndpointCallbacks {
                rx: Some(Arc::new(move |seg: Segment, _: SocketAddr, _: SocketAddr| {
                    sink.lock().push((clock.now(), seg.payload));
                })),
                ..EndpointCallbacks::default()
            },
        );
        let seg = Segment::new(
            TcpHeader {
                source_port: 5000,
                destination_port: 80,
                flags: flags::ACK,
                ..TcpHeader::default()
            },
            b"hi".to_vec(),
        );
        net.send_packet(seg, addr("10.0.0.1:5000"), addr("10.0.0.2:80"));
        sim.run();
        assert_eq!(*got.lock(), vec![(Duration::from_millis(10), b"hi".to_vec())]);
    }

    #[test]
    fn unmatched_syn_is_answered_with_rst() {
        let (mut sim, net, a, _) = setup();
        let ep = net.allocate(a, Some(addr("10.0.0.1:5000"))).unwrap();
        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        net.set_callbacks(
            ep.id,
            EndpointCallbacks {
                rx: Some(Arc::new(move |seg: Segment, _: SocketAddr, _: SocketAddr| *sink.lock() = Some(seg.header))),
                ..EndpointCallbacks::default()
            },
        );
        let syn = TcpHeader {
            source_port: 5000,
            destination_port: 80,
            seq: SequenceNumber::new(100),
            flags: flags::SYN,
            ..TcpHeader::default()
        };
        net.send_packet(Segment::new(syn, Vec::new()), addr("10.0.0.1:5000"), addr("10.0.0.2:80"));
        sim.run();
        let rst = got.lock().clone().unwrap();
        assert!(rst.has_flag(flags::RST));
        assert_eq!(rst.ack, SequenceNumber::new(101));
        assert_eq!(net.stats().unmatched, 1);
    }

    #[test]
    fn bandwidth_serialises_back_to_back_segments() {
        let sim = Simulator::new(SimulatorConfig { workers: 0 }).unwrap();
        let link = LinkConfig {
            delay: Duration::ZERO,
            bandwidth: Some(1_000),
            ..LinkConfig::default()
        };
        let net = Network::new(sim.handle(), link);
        net.add_node("10.0.0.1".parse().unwrap());
        net.add_node("10.0.0.2".parse().unwrap());
        let mut sim = sim;
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let ep = net.allocate(1, Some(addr("10.0.0.2:80"))).unwrap();
        let sink = Arc::clone(&arrivals);
        let clock = sim.handle().clock();
        net.set_callbacks(
            ep.id,
            EndpointCallbacks {
                rx: Some(Arc::new(move |_: Segment, _: SocketAddr, _: SocketAddr| sink.lock().push(clock.now()))),
                ..EndpointCallbacks::default()
            },
        );
        for _ in 0..2 {
            let h = TcpHeader {
                source_port: 5000,
                destination_port: 80,
                flags: flags::ACK,
                ..TcpHeader::default()
            };
            // 20-byte header + 80 bytes = 100 ms at 1000 B/s.
            net.send_packet(Segment::new(h, vec![0; 80]), addr("10.0.0.1:5000"), addr("10.0.0.2:80"));
        }
        sim.run();
        assert_eq!(
            *arrivals.lock(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn destroy_notifies_every_endpoint() {
        let (_sim, net, a, b) = setup();
        let count = Arc::new(Mutex::new(0));
        for node in [a, b] {
            let ep = net.allocate(node, None).unwrap();
            let c = Arc::clone(&count);
            net.set_callbacks(
                ep.id,
                EndpointCallbacks {
                    destroy: Some(Arc::new(move || *c.lock() += 1)),
                    ..EndpointCallbacks::default()
                },
            );
        }
        net.destroy();
        assert_eq!(*count.lock(), 2);
        assert_eq!(net.endpoint_count(), 0);
    }
}
