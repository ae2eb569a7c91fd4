//! Entry point for `tcp-sim`.
//!
//! Parses CLI arguments and runs one of the demo simulations.  All protocol
//! and scheduling work lives in the library; `main.rs` owns only process
//! setup (logging, argument parsing) and the reporting.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tcp_sim::{
    CongestionAlgorithm, LinkConfig, Network, SequenceNumber, SimulatorConfig, Simulator,
    TcpConfig, TcpSocket,
};

const SERVER_PORT: u16 = 5000;
const WRITE_CHUNK: u32 = 4096;

/// Discrete-event TCP simulation.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Transfer a block of bytes between two nodes and report how it went.
    Bulk {
        /// Bytes the client sends.
        #[arg(short, long, default_value_t = 1_000_000)]
        bytes: u32,
        /// One-way link delay in milliseconds.
        #[arg(short, long, default_value_t = 10)]
        delay_ms: u64,
        /// Link rate in bytes per second (unlimited if absent).
        #[arg(long)]
        bandwidth: Option<u64>,
        /// Per-segment loss probability.
        #[arg(short, long, default_value_t = 0.0)]
        loss: f64,
        /// Congestion control: newreno or veno.
        #[arg(short, long, default_value = "newreno")]
        congestion: CongestionAlgorithm,
        /// Enable selective acknowledgements on both ends.
        #[arg(long)]
        sack: bool,
        /// Maximum segment size in bytes.
        #[arg(long, default_value_t = 536)]
        segment_size: u32,
        /// Seed for the link's fault generator.
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Schedule events from worker jobs and check they run in global order.
    Jobs {
        /// Worker threads.
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// Number of jobs.
        #[arg(short, long, default_value_t = 8)]
        jobs: usize,
        /// Events scheduled by each job.
        #[arg(short, long, default_value_t = 1000)]
        events: usize,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Bulk {
            bytes,
            delay_ms,
            bandwidth,
            loss,
            congestion,
            sack,
            segment_size,
            seed,
        } => {
            let link = LinkConfig {
                delay: Duration::from_millis(delay_ms),
                bandwidth,
                loss_rate: loss,
                corrupt_rate: 0.0,
                seed,
            };
            let tcp = TcpConfig {
                sack,
                segment_size,
                congestion,
                ..TcpConfig::default()
            };
            run_bulk(bytes, link, tcp)
        }
        Mode::Jobs {
            workers,
            jobs,
            events,
        } => run_jobs(workers, jobs, events),
    }
}

// ---------------------------------------------------------------------------
// bulk
// ---------------------------------------------------------------------------

fn run_bulk(bytes: u32, link: LinkConfig, tcp: TcpConfig) -> anyhow::Result<()> {
    log::info!("bulk transfer of {bytes} bytes, {} over {link:?}", tcp.congestion);
    let mut sim = Simulator::new(SimulatorConfig { workers: 0 })?;
    let handle = sim.handle();
    let net = Network::new(sim.handle(), link);

    let server_ip: IpAddr = "10.0.0.1".parse()?;
    let client_ip: IpAddr = "10.0.0.2".parse()?;
    let server_node = net.add_node(server_ip);
    let client_node = net.add_node(client_ip);
    let server_addr = SocketAddr::new(server_ip, SERVER_PORT);

    // Server: drain everything, close when the client does.
    let received = Arc::new(AtomicU64::new(0));
    let finished_at = Arc::new(Mutex::new(None::<Duration>));
    let server = TcpSocket::new(&net, server_node, tcp.clone());
    server.bind(Some(server_addr)).context("binding the server")?;
    server.listen().context("listening")?;
    {
        let received = Arc::clone(&received);
        let finished_at = Arc::clone(&finished_at);
        let handle = handle.clone();
        server.set_recv_callback(move |s| {
            while let Some(data) = s.recv(u32::MAX) {
                if data.is_empty() {
                    break;
                }
                let total = received.fetch_add(data.len() as u64, Ordering::Relaxed)
                    + data.len() as u64;
                if total >= u64::from(bytes) {
                    *finished_at.lock() = Some(handle.now());
                }
            }
        });
    }
    server.set_close_callbacks(
        |s| {
            if let Err(e) = s.close() {
                log::warn!("server close failed: {e}");
            }
        },
        |s| log::warn!("server connection {} aborted", s.id()),
    );

    // Client: keep the send buffer full, close once everything is queued.
    let client = TcpSocket::new(&net, client_node, tcp);
    let remaining = Arc::new(AtomicU32::new(bytes));
    let closed = Arc::new(AtomicBool::new(false));
    let fill = {
        let remaining = Arc::clone(&remaining);
        let closed = Arc::clone(&closed);
        move |s: &TcpSocket| loop {
            let left = remaining.load(Ordering::Relaxed);
            if left == 0 {
                if !closed.swap(true, Ordering::Relaxed) {
                    if let Err(e) = s.close() {
                        log::warn!("client close failed: {e}");
                    }
                }
                return;
            }
            let n = left.min(s.tx_available()).min(WRITE_CHUNK);
            if n == 0 {
                return;
            }
            if let Err(e) = s.send(&vec![0u8; n as usize]) {
                log::warn!("client send failed: {e}");
                return;
            }
            remaining.fetch_sub(n, Ordering::Relaxed);
        }
    };
    let fill = Arc::new(fill);
    {
        let on_connect = Arc::clone(&fill);
        client.set_connect_callback(
            move |s| on_connect(s),
            |s| log::error!("client {} could not connect", s.id()),
        );
        let on_space = Arc::clone(&fill);
        client.set_send_callback(move |s, _| on_space(s));
    }

    let retransmissions = Arc::new(AtomicU64::new(0));
    {
        let retransmissions = Arc::clone(&retransmissions);
        let mut high: Option<SequenceNumber> = None;
        client.with_traces(move |t| {
            t.tx.connect(move |h, payload, _| {
                if payload.is_empty() {
                    return;
                }
                let end = h.seq + payload.len() as u32;
                match high {
                    Some(hi) if end <= hi => {
                        retransmissions.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => high = Some(end),
                }
            })
        });
    }

    client.connect(server_addr).context("connecting")?;
    sim.run();

    let got = received.load(Ordering::Relaxed);
    let stats = net.stats();
    println!("congestion     : {}", client.config().congestion);
    println!("sack           : {:?}", client.negotiated().sack);
    println!("bytes received : {got} / {bytes}");
    match *finished_at.lock() {
        Some(t) => {
            let secs = t.as_secs_f64();
            println!("completed at   : {secs:.3} s");
            if secs > 0.0 {
                println!("goodput        : {:.1} kB/s", got as f64 / secs / 1000.0);
            }
        }
        None => println!("completed at   : never"),
    }
    println!(
        "retransmitted  : {} segments",
        retransmissions.load(Ordering::Relaxed)
    );
    println!(
        "link           : {} sent, {} lost, {} delivered",
        stats.sent, stats.lost, stats.delivered
    );
    println!("final state    : client {}, server {}", client.state(), server.state());
    println!("simulated time : {:?}", sim.now());

    net.destroy();
    sim.destroy();
    if got != u64::from(bytes) {
        bail!("transfer incomplete: {got} of {bytes} bytes");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

fn run_jobs(workers: usize, jobs: usize, events: usize) -> anyhow::Result<()> {
    let mut sim = Simulator::new(SimulatorConfig { workers })?;
    let handle = sim.handle();
    let order = Arc::new(Mutex::new(Vec::with_capacity(jobs * events)));

    let pending: Vec<_> = (0..jobs)
        .map(|j| {
            let order = Arc::clone(&order);
            handle.add_job(move |h| {
                let mut rng = StdRng::seed_from_u64(j as u64);
                for _ in 0..events {
                    let delay = Duration::from_micros(rng.gen_range(1..1_000_000));
                    let order = Arc::clone(&order);
                    let clock = h.clock();
                    h.schedule(delay, move || order.lock().push(clock.now()));
                }
                events
            })
        })
        .collect();

    let mut scheduled = 0;
    for job in pending {
        scheduled += job.wait()?;
    }
    log::info!("{jobs} jobs scheduled {scheduled} events");

    sim.run();
    let order = order.lock();
    let sorted = order.windows(2).all(|w| w[0] <= w[1]);
    println!("events scheduled : {scheduled}");
    println!("events executed  : {}", order.len());
    println!("in global order  : {sorted}");
    println!("simulated time   : {:?}", sim.now());
    drop(order);
    sim.destroy();

    if !sorted {
        bail!("events ran out of timestamp order");
    }
    Ok(())
}
