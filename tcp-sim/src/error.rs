//! Error types surfaced to callers.
//!
//! Network-visible failures that happen asynchronously (refused
//! connections, exhausted retries) are delivered as socket notifications,
//! not as these errors.  Broken internal invariants panic.

use thiserror::Error;

/// Socket-level error returned synchronously from application calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketErrno {
    #[error("socket is not connected")]
    NotConn,
    #[error("message does not fit in the send buffer")]
    MsgSize,
    #[error("socket has been shut down for sending")]
    Shutdown,
    #[error("invalid argument or operation in the current state")]
    Inval,
    #[error("no route to host")]
    NoRouteToHost,
    #[error("address not available")]
    AddrNotAvail,
    #[error("address already in use")]
    AddrInUse,
    #[error("operation not supported")]
    OpNotSupp,
}

/// Failures of the simulation runtime itself.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to build the job runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("job did not complete: {0}")]
    JobPanicked(String),
}
