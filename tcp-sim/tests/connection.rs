//! End-to-end tests of the TCP engine over the simulated network.
//!
//! Every test builds a two-node network on a single-threaded simulator,
//! wires sockets together through callbacks and runs the event loop to
//! completion.  Assertions are made on what the application saw and on the
//! final socket states.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tcp_sim::endpoint::NodeId;
use tcp_sim::packet::flags;
use tcp_sim::{
    LinkConfig, Network, SequenceNumber, SimulatorConfig, Simulator, SocketErrno, TcpConfig,
    TcpSocket, TcpState,
};

const SERVER_PORT: u16 = 5000;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Testbed {
    sim: Simulator,
    net: Arc<Network>,
    server_node: NodeId,
    client_node: NodeId,
    server_addr: SocketAddr,
}

fn testbed(link: LinkConfig) -> Testbed {
    let sim = Simulator::new(SimulatorConfig { workers: 0 }).unwrap();
    let net = Network::new(sim.handle(), link);
    let server_ip: IpAddr = "10.0.0.1".parse().unwrap();
    let client_ip: IpAddr = "10.0.0.2".parse().unwrap();
    let server_node = net.add_node(server_ip);
    let client_node = net.add_node(client_ip);
    Testbed {
        sim,
        net,
        server_node,
        client_node,
        server_addr: SocketAddr::new(server_ip, SERVER_PORT),
    }
}

impl Testbed {
    fn finish(self) {
        self.net.destroy();
        self.sim.destroy();
    }
}

/// A listener that keeps every accepted socket.
struct Server {
    listener: TcpSocket,
    accepted: Arc<Mutex<Vec<TcpSocket>>>,
}

impl Server {
    fn child(&self) -> TcpSocket {
        self.accepted.lock().unwrap()[0].clone()
    }
}

fn listen(bed: &Testbed, config: TcpConfig) -> Server {
    let listener = TcpSocket::new(&bed.net, bed.server_node, config);
    listener.bind(Some(bed.server_addr)).unwrap();
    listener.listen().unwrap();
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accepted);
    listener.set_accept_callback(
        |_, _| true,
        move |s, _| sink.lock().unwrap().push(s.clone()),
    );
    Server { listener, accepted }
}

/// Drain everything readable into `sink`; close when the peer does.
fn drain_and_close(server: &Server, sink: Arc<Mutex<Vec<u8>>>) {
    server.listener.set_recv_callback(move |s| {
        while let Some(data) = s.recv(u32::MAX) {
            if data.is_empty() {
                break;
            }
            sink.lock().unwrap().extend_from_slice(&data);
        }
    });
    server
        .listener
        .set_close_callbacks(|s| s.close().unwrap(), |_| {});
}

/// Queue `data` on `client` as buffer space allows, then close.
fn stream_then_close(client: &TcpSocket, data: Vec<u8>) {
    let data = Arc::new(data);
    let offset = Arc::new(AtomicUsize::new(0));
    let fill = move |s: &TcpSocket| loop {
        let off = offset.load(Ordering::SeqCst);
        if off == data.len() {
            if s.state() == TcpState::Established {
                s.close().unwrap();
            }
            return;
        }
        let n = (data.len() - off).min(s.tx_available() as usize).min(4096);
        if n == 0 {
            return;
        }
        s.send(&data[off..off + n]).unwrap();
        offset.store(off + n, Ordering::SeqCst);
    };
    let fill = Arc::new(fill);
    let on_connect = Arc::clone(&fill);
    client.set_connect_callback(move |s| on_connect(s), |_| panic!("connection failed"));
    client.set_send_callback(move |s, _| fill(s));
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn transfer(bed: &mut Testbed, config: TcpConfig, len: usize) -> (TcpSocket, TcpSocket, Vec<u8>) {
    let server = listen(bed, config.clone());
    let received = Arc::new(Mutex::new(Vec::new()));
    drain_and_close(&server, Arc::clone(&received));

    let client = TcpSocket::new(&bed.net, bed.client_node, config);
    stream_then_close(&client, pattern(len));
    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    let data = received.lock().unwrap().clone();
    (client, server.child(), data)
}

// ---------------------------------------------------------------------------
// Handshake and options
// ---------------------------------------------------------------------------

#[test]
fn handshake_establishes_both_ends() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(&bed, TcpConfig::default());
    let client = TcpSocket::new(&bed.net, bed.client_node, TcpConfig::default());
    let connected = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&connected);
    client.set_connect_callback(move |_| flag.store(true, Ordering::SeqCst), |_| {});

    client.connect(bed.server_addr).unwrap();
    assert_eq!(client.state(), TcpState::SynSent);
    bed.sim.run();

    assert!(connected.load(Ordering::SeqCst));
    assert_eq!(client.state(), TcpState::Established);
    assert_eq!(server.listener.state(), TcpState::Listen);
    let child = server.child();
    assert_eq!(child.state(), TcpState::Established);
    assert_eq!(child.peer_addr(), client.local_addr());
    assert_eq!(client.peer_addr(), Some(bed.server_addr));

    let negotiated = client.negotiated();
    assert!(negotiated.timestamp);
    assert!(negotiated.window_scale.is_some());
    assert_eq!(negotiated.window_scale, child.negotiated().window_scale);
    // SYN, SYN-ACK and the final ACK, 10 ms each; nothing is left pending.
    assert_eq!(bed.sim.now(), Duration::from_millis(30));
    bed.finish();
}

#[test]
fn sack_is_used_only_when_both_ends_offer_it() {
    for (client_sack, server_sack) in [(false, false), (true, false), (false, true), (true, true)] {
        let mut bed = testbed(LinkConfig::default());
        let server = listen(
            &bed,
            TcpConfig {
                sack: server_sack,
                ..TcpConfig::default()
            },
        );
        let client = TcpSocket::new(
            &bed.net,
            bed.client_node,
            TcpConfig {
                sack: client_sack,
                ..TcpConfig::default()
            },
        );
        client.connect(bed.server_addr).unwrap();
        bed.sim.run();

        let expected = client_sack && server_sack;
        assert_eq!(client.negotiated().sack, expected, "client {client_sack}/{server_sack}");
        assert_eq!(server.child().negotiated().sack, expected, "server {client_sack}/{server_sack}");
        bed.finish();
    }
}

#[test]
fn connecting_to_a_closed_port_fails() {
    let mut bed = testbed(LinkConfig::default());
    let client = TcpSocket::new(&bed.net, bed.client_node, TcpConfig::default());
    let failed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed);
    client.set_connect_callback(
        |_| panic!("nobody is listening"),
        move |_| flag.store(true, Ordering::SeqCst),
    );

    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(bed.net.stats().unmatched, 1);
    bed.finish();
}

#[test]
fn connecting_to_an_unknown_host_reports_no_route() {
    let bed = testbed(LinkConfig::default());
    let client = TcpSocket::new(&bed.net, bed.client_node, TcpConfig::default());
    let nowhere = SocketAddr::new("10.0.0.99".parse().unwrap(), SERVER_PORT);

    assert_eq!(client.connect(nowhere), Err(SocketErrno::NoRouteToHost));
    assert_eq!(client.errno(), Some(SocketErrno::NoRouteToHost));
    assert_eq!(client.state(), TcpState::Closed);
    bed.finish();
}

// ---------------------------------------------------------------------------
// Data transfer
// ---------------------------------------------------------------------------

#[test]
fn lossless_bulk_transfer_delivers_every_byte() {
    let mut bed = testbed(LinkConfig::default());
    let (client, child, data) = transfer(&mut bed, TcpConfig::default(), 200_000);

    assert_eq!(data.len(), 200_000);
    assert_eq!(data, pattern(200_000));
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(child.state(), TcpState::Closed);
    // The client lingered in TIME_WAIT for 2 MSL.
    assert!(bed.sim.now() >= Duration::from_secs(240));
    bed.finish();
}

#[test]
fn lossy_transfer_with_sack_delivers_every_byte() {
    let link = LinkConfig {
        loss_rate: 0.02,
        seed: 7,
        ..LinkConfig::default()
    };
    let mut bed = testbed(link);
    let config = TcpConfig {
        sack: true,
        ..TcpConfig::default()
    };
    let (_client, _child, data) = transfer(&mut bed, config, 100_000);

    assert_eq!(data, pattern(100_000));
    assert!(bed.net.stats().lost > 0);
}

#[test]
fn lossy_transfer_with_veno_delivers_every_byte() {
    let link = LinkConfig {
        loss_rate: 0.01,
        seed: 3,
        ..LinkConfig::default()
    };
    let mut bed = testbed(link);
    let config = TcpConfig {
        congestion: "veno".parse().unwrap(),
        ..TcpConfig::default()
    };
    let (_client, _child, data) = transfer(&mut bed, config, 60_000);

    assert_eq!(data, pattern(60_000));
}

#[test]
fn sequence_numbers_wrap_around() {
    let mut bed = testbed(LinkConfig::default());
    let config = TcpConfig {
        initial_sequence: u32::MAX - 100,
        ..TcpConfig::default()
    };
    let (client, child, data) = transfer(&mut bed, config, 20_000);

    assert_eq!(data, pattern(20_000));
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(child.state(), TcpState::Closed);
    bed.finish();
}

#[test]
fn late_ack_after_a_timeout_stops_the_retransmission() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(&bed, TcpConfig::default());
    let received = Arc::new(Mutex::new(Vec::new()));
    drain_and_close(&server, Arc::clone(&received));

    // Every ACK the server sends between 25 ms and 1 s is lost.
    let clock = bed.sim.handle().clock();
    bed.net.set_drop_filter(move |h, payload| {
        let now = clock.now();
        h.source_port == SERVER_PORT
            && payload.is_empty()
            && now >= Duration::from_millis(25)
            && now < Duration::from_secs(1)
    });

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            initial_cwnd: 4,
            ..TcpConfig::default()
        },
    );
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sent);
    client.with_traces(|t| {
        t.tx.connect(move |h, payload, _| {
            if !payload.is_empty() {
                sink.lock().unwrap().push(h.seq);
            }
        })
    });
    client.set_connect_callback(
        |s| {
            s.send(&pattern(2000)).unwrap();
        },
        |_| {},
    );
    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    // Four segments, then one RTO retransmission answered by ACK 2001.
    let seqs: Vec<SequenceNumber> = [1, 537, 1073, 1609, 1]
        .into_iter()
        .map(SequenceNumber::new)
        .collect();
    assert_eq!(*sent.lock().unwrap(), seqs);
    assert_eq!(*received.lock().unwrap(), pattern(2000));
    assert_eq!(client.tx_available(), TcpConfig::default().snd_buf_size);
    assert_eq!(client.state(), TcpState::Established);
    bed.finish();
}

#[test]
fn nagle_coalesces_small_writes() {
    fn payload_sizes(no_delay: bool) -> Vec<usize> {
        let mut bed = testbed(LinkConfig::default());
        let config = TcpConfig {
            tcp_no_delay: no_delay,
            ..TcpConfig::default()
        };
        let server = listen(&bed, config.clone());
        server.listener.set_recv_callback(|s| while s.recv(u32::MAX).is_some_and(|d| !d.is_empty()) {});

        let client = TcpSocket::new(&bed.net, bed.client_node, config);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sizes);
        client.with_traces(|t| {
            t.tx.connect(move |_, payload, _| {
                if !payload.is_empty() {
                    sink.lock().unwrap().push(payload.len());
                }
            })
        });
        let handle = bed.sim.handle();
        client.set_connect_callback(
            move |s| {
                s.send(&[1; 100]).unwrap();
                for ms in [1, 2] {
                    let s = s.clone();
                    handle.schedule(Duration::from_millis(ms), move || {
                        s.send(&[2; 100]).unwrap();
                    });
                }
            },
            |_| {},
        );
        client.connect(bed.server_addr).unwrap();
        bed.sim.run();

        let sizes = sizes.lock().unwrap().clone();
        bed.finish();
        sizes
    }

    assert_eq!(payload_sizes(true), vec![100, 100, 100]);
    assert_eq!(payload_sizes(false), vec![100, 200]);
}

// ---------------------------------------------------------------------------
// Timers and teardown
// ---------------------------------------------------------------------------

#[test]
fn retransmission_timeout_backs_off_exponentially() {
    let mut bed = testbed(LinkConfig::default());
    let _server = listen(&bed, TcpConfig::default());
    bed.net.set_drop_filter(|_, payload| !payload.is_empty());

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            data_retries: 10,
            ..TcpConfig::default()
        },
    );
    let sent_at = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sent_at);
    let clock = bed.sim.handle().clock();
    client.with_traces(|t| {
        t.tx.connect(move |_, payload, _| {
            if !payload.is_empty() {
                sink.lock().unwrap().push(clock.now());
            }
        })
    });
    let aborted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&aborted);
    client.set_connect_callback(
        |s| {
            s.send(&[0; 100]).unwrap();
        },
        |_| {},
    );
    client.set_close_callbacks(|_| {}, move |_| flag.store(true, Ordering::SeqCst));

    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    let sent_at = sent_at.lock().unwrap();
    // The first transmission plus one per retry.
    assert_eq!(sent_at.len(), 11);
    let gaps: Vec<u64> = sent_at.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(&gaps[..8], &[1, 2, 4, 8, 16, 32, 60, 60]);
    assert!(aborted.load(Ordering::SeqCst));
    assert_eq!(client.state(), TcpState::Closed);
}

#[test]
fn delayed_acks_wait_or_cover_two_segments() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(&bed, TcpConfig::default());
    drain_and_close(&server, Arc::new(Mutex::new(Vec::new())));

    let acks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&acks);
    let clock = bed.sim.handle().clock();
    bed.net.set_drop_filter(move |h, payload| {
        if h.source_port == SERVER_PORT && payload.is_empty() && !h.has_flag(flags::SYN) {
            sink.lock().unwrap().push((clock.now(), h.ack));
        }
        false
    });

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            initial_cwnd: 4,
            ..TcpConfig::default()
        },
    );
    let handle = bed.sim.handle();
    client.set_connect_callback(
        move |s| {
            s.send(&[1; 100]).unwrap();
            let s = s.clone();
            handle.schedule(Duration::from_millis(980), move || {
                s.send(&[2; 1072]).unwrap();
            });
        },
        |_| {},
    );
    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    // A lone segment waits for the 200 ms timer; the second of a pair is
    // acknowledged on arrival.
    assert_eq!(
        *acks.lock().unwrap(),
        vec![
            (Duration::from_millis(230), SequenceNumber::new(101)),
            (Duration::from_millis(1010), SequenceNumber::new(1173)),
        ]
    );
    bed.finish();
}

#[test]
fn zero_window_is_probed_until_it_reopens() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(
        &bed,
        TcpConfig {
            rcv_buf_size: 1072,
            ..TcpConfig::default()
        },
    );
    let received = Arc::new(Mutex::new(Vec::new()));
    let reading = Arc::new(AtomicBool::new(false));
    let drain = {
        let received = Arc::clone(&received);
        let reading = Arc::clone(&reading);
        move |s: &TcpSocket| {
            if !reading.load(Ordering::SeqCst) {
                return;
            }
            while let Some(data) = s.recv(u32::MAX) {
                if data.is_empty() {
                    break;
                }
                received.lock().unwrap().extend_from_slice(&data);
            }
        }
    };
    let drain = Arc::new(drain);
    let on_recv = Arc::clone(&drain);
    server.listener.set_recv_callback(move |s| on_recv(s));
    server
        .listener
        .set_close_callbacks(|s| s.close().unwrap(), |_| panic!("server aborted"));

    // The application starts reading only after 20 s.
    let accepted = Arc::clone(&server.accepted);
    bed.sim.handle().schedule(Duration::from_secs(20), move || {
        reading.store(true, Ordering::SeqCst);
        let child = accepted.lock().unwrap()[0].clone();
        drain(&child);
    });

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            initial_cwnd: 4,
            ..TcpConfig::default()
        },
    );
    let probes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&probes);
    let clock = bed.sim.handle().clock();
    client.with_traces(|t| {
        t.tx.connect(move |_, payload, _| {
            let now = clock.now();
            if payload.len() == 1 && now < Duration::from_secs(20) {
                sink.lock().unwrap().push(now);
            }
        })
    });
    stream_then_close(&client, pattern(3000));
    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    // The zero window is learned at 40 ms; probes back off from 6 s.
    assert_eq!(
        *probes.lock().unwrap(),
        vec![Duration::from_millis(6040), Duration::from_millis(18_040)]
    );
    assert_eq!(*received.lock().unwrap(), pattern(3000));
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(server.child().state(), TcpState::Closed);
    bed.finish();
}

#[test]
fn timeout_with_nothing_in_flight_leaves_close_wait_alone() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(
        &bed,
        TcpConfig {
            initial_cwnd: 4,
            ..TcpConfig::default()
        },
    );
    // Once the client has closed, answer with more than its window holds.
    server.listener.set_close_callbacks(
        |s| {
            s.send(&pattern(3000)).unwrap();
        },
        |_| panic!("server aborted"),
    );

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            rcv_buf_size: 1072,
            ..TcpConfig::default()
        },
    );
    client.set_connect_callback(|s| s.close().unwrap(), |_| {});
    client.connect(bed.server_addr).unwrap();
    bed.sim.stop_at(Duration::from_secs(3));
    bed.sim.run();

    // Both segments were acknowledged with a zero window at 50 ms; the
    // retransmission timer armed by that ACK finds nothing to resend.
    let child = server.child();
    assert_eq!(child.state(), TcpState::CloseWait);
    assert_eq!(child.ssthresh(), TcpConfig::default().initial_ssthresh);
    assert!(child.cwnd() >= 4 * 536, "cwnd collapsed to {}", child.cwnd());
}

#[test]
fn active_close_passes_through_time_wait() {
    let mut bed = testbed(LinkConfig::default());
    let server = listen(&bed, TcpConfig::default());
    server
        .listener
        .set_close_callbacks(|s| s.close().unwrap(), |_| panic!("server aborted"));

    let client = TcpSocket::new(&bed.net, bed.client_node, TcpConfig::default());
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let clock = bed.sim.handle().clock();
    client.with_traces(|t| {
        t.state
            .connect(move |_, new| sink.lock().unwrap().push((new, clock.now())))
    });
    client.set_connect_callback(|s| s.close().unwrap(), |_| {});

    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    let states = states.lock().unwrap();
    let order: Vec<TcpState> = states.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        order,
        vec![
            TcpState::SynSent,
            TcpState::Established,
            TcpState::FinWait1,
            TcpState::FinWait2,
            TcpState::TimeWait,
            TcpState::Closed,
        ]
    );
    let linger = states[5].1 - states[4].1;
    assert_eq!(linger, Duration::from_secs(240));
    assert_eq!(server.child().state(), TcpState::Closed);
    bed.finish();
}

#[test]
fn listener_can_refuse_a_peer() {
    let mut bed = testbed(LinkConfig::default());
    let listener = TcpSocket::new(&bed.net, bed.server_node, TcpConfig::default());
    listener.bind(Some(bed.server_addr)).unwrap();
    listener.listen().unwrap();
    let created = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&created);
    listener.set_accept_callback(|_, _| false, move |_, _| flag.store(true, Ordering::SeqCst));

    let client = TcpSocket::new(
        &bed.net,
        bed.client_node,
        TcpConfig {
            syn_retries: 1,
            ..TcpConfig::default()
        },
    );
    let failed = Arc::new(AtomicBool::new(false));
    let failed_flag = Arc::clone(&failed);
    client.set_connect_callback(|_| {}, move |_| failed_flag.store(true, Ordering::SeqCst));
    client.connect(bed.server_addr).unwrap();
    bed.sim.run();

    assert!(!created.load(Ordering::SeqCst));
    assert!(failed.load(Ordering::SeqCst));
    assert_eq!(client.state(), TcpState::Closed);
    bed.finish();
}
