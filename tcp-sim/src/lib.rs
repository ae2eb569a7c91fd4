//! `tcp-sim`: a discrete-event simulation of TCP.
//!
//! # Architecture
//!
//! ```text
//!  ┌─────────────┐  calls / callbacks   ┌──────────────────────────────┐
//!  │ application │◀────────────────────▶│          TcpSocket           │
//!  └─────────────┘                      └──────────────┬───────────────┘
//!                                                      │ locked
//!                                       ┌──────────────▼───────────────┐
//!                                       │   Connection (engine)        │
//!                                       │  TxBuffer · RxBuffer · TCB   │
//!                                       │  CongestionOps · RTT · timers│
//!                                       └──────┬───────────────▲───────┘
//!                                  send_packet │               │ rx callback
//!                                       ┌──────▼───────────────┴───────┐
//!                                       │ Network (L4Protocol)         │
//!                                       │ demux · routing · lossy link │
//!                                       └──────────────┬───────────────┘
//!                                                      │ events
//!                                       ┌──────────────▼───────────────┐
//!                                       │ Simulator                    │
//!                                       │ ledger · inboxes · job pool  │
//!                                       └──────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`seq`]: wrap-aware 32-bit sequence numbers
//! - [`packet`]: TCP header, options and the segment codec
//! - [`state`]: connection and congestion state enums
//! - [`config`]: socket, link and simulator configuration
//! - [`error`]: error types
//! - [`traced`]: observable values and segment traces
//! - [`rtt`]: RTT estimator and retransmission history
//! - [`tx_buffer`]: transmit buffer and SACK scoreboard
//! - [`rx_buffer`]: receive buffer and SACK block list
//! - [`tcb`]: transmission control block
//! - [`congestion`]: NewReno and Veno
//! - [`simulator`]: concurrent discrete-event scheduler
//! - [`endpoint`]: endpoints and the transport-protocol seam
//! - [`network`]: the simulated network
//! - [`implementation`]: the socket/engine seam
//! - [`connection`]: the engine: send path, timers, application calls
//! - `input`: the engine's receive path
//! - [`trace`]: per-connection trace sources
//! - [`socket`]: application-facing socket handles

pub mod config;
pub mod congestion;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod implementation;
mod input;
pub mod network;
pub mod packet;
pub mod rtt;
pub mod rx_buffer;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod tcb;
pub mod trace;
pub mod traced;
pub mod tx_buffer;

pub use config::{LinkConfig, SimulatorConfig, TcpConfig};
pub use congestion::CongestionAlgorithm;
pub use error::{SimError, SocketErrno};
pub use network::Network;
pub use seq::SequenceNumber;
pub use simulator::{SimHandle, Simulator};
pub use socket::TcpSocket;
pub use state::{CongState, TcpState};
