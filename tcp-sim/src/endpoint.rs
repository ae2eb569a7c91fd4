//! Transport endpoints and the network interface the TCP engine consumes.
//!
//! An [`Endpoint`] is a bound `(local, peer?)` pair on one node.  The engine
//! allocates one, registers [`EndpointCallbacks`] on it, and from then on
//! talks to the network only through [`L4Protocol`].  Addresses are plain
//! [`SocketAddr`] values, so IPv4 and IPv6 endpoints are the same type.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::SocketErrno;
use crate::packet::Segment;

/// Index of a node in the simulated network.  Also used as the event
/// context for everything that happens on that node.
pub type NodeId = u32;

/// Unique endpoint identifier.
pub type EndpointId = u64;

/// A bound transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub node: NodeId,
    pub local: SocketAddr,
    /// `None` for a listening (or merely bound) endpoint.
    pub peer: Option<SocketAddr>,
}

impl Endpoint {
    /// Whether a segment from `from` to `to` belongs to this endpoint.  An
    /// unspecified local address matches any destination address.
    pub fn matches(&self, from: SocketAddr, to: SocketAddr) -> bool {
        let local_ok = self.local.port() == to.port()
            && (self.local.ip() == to.ip() || self.local.ip().is_unspecified());
        local_ok && self.peer.map_or(true, |p| p == from)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{} <-> {}", self.local, peer),
            None => write!(f, "{} (unconnected)", self.local),
        }
    }
}

/// An ICMP error report delivered to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Icmp {
    pub source: IpAddr,
    pub ttl: u8,
    pub kind: u8,
    pub code: u8,
    pub info: u32,
}

/// `(segment, from, to)`.
pub type RxCallback = Arc<dyn Fn(Segment, SocketAddr, SocketAddr) + Send + Sync>;
pub type IcmpCallback = Arc<dyn Fn(Icmp) + Send + Sync>;
pub type DestroyCallback = Arc<dyn Fn() + Send + Sync>;

/// What the network calls on an endpoint's owner.
#[derive(Clone, Default)]
pub struct EndpointCallbacks {
    pub rx: Option<RxCallback>,
    pub icmp: Option<IcmpCallback>,
    /// The network is tearing the endpoint down on its own.
    pub destroy: Option<DestroyCallback>,
}

impl fmt::Debug for EndpointCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCallbacks")
            .field("rx", &self.rx.is_some())
            .field("icmp", &self.icmp.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

/// Demultiplexing and delivery services offered to a transport protocol.
pub trait L4Protocol: Send + Sync {
    /// Bind on `node`.  `None`, or port 0, picks an ephemeral port.
    fn allocate(&self, node: NodeId, local: Option<SocketAddr>) -> Result<Endpoint, SocketErrno>;

    /// Bind a fully specified four-tuple.
    fn allocate_full(
        &self,
        node: NodeId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Endpoint, SocketErrno>;

    /// Attach a peer to an existing endpoint, fixing its local address.
    fn connect_endpoint(
        &self,
        id: EndpointId,
        local_ip: IpAddr,
        peer: SocketAddr,
    ) -> Result<Endpoint, SocketErrno>;

    fn set_callbacks(&self, id: EndpointId, callbacks: EndpointCallbacks);

    /// Release an endpoint.  Its callbacks are dropped without being called.
    fn deallocate(&self, id: EndpointId);

    /// Source address to use from `node` towards `dst`.
    fn route_output(&self, node: NodeId, dst: IpAddr) -> Result<IpAddr, SocketErrno>;

    fn send_packet(&self, segment: Segment, src: SocketAddr, dst: SocketAddr);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_listener_matches_any_peer() {
        let ep = Endpoint {
            id: 1,
            node: 0,
            local: addr("0.0.0.0:80"),
            peer: None,
        };
        assert!(ep.matches(addr("10.0.0.2:5000"), addr("10.0.0.1:80")));
        assert!(!ep.matches(addr("10.0.0.2:5000"), addr("10.0.0.1:81")));
    }

    #[test]
    fn connected_endpoint_matches_only_its_peer() {
        let ep = Endpoint {
            id: 1,
            node: 0,
            local: addr("[fe80::1]:80"),
            peer: Some(addr("[fe80::2]:5000")),
        };
        assert!(ep.matches(addr("[fe80::2]:5000"), addr("[fe80::1]:80")));
        assert!(!ep.matches(addr("[fe80::3]:5000"), addr("[fe80::1]:80")));
        assert_eq!(ep.to_string(), "[fe80::1]:80 <-> [fe80::2]:5000");
    }
}
