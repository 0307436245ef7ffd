//! Error taxonomy for socket operations.
//!
//! Network failures never escape the manager as `Err`: they are rendered
//! with `Display` into `Error` events scoped to the affected id.

use std::io;
use std::net::SocketAddr;

use super::ConnectionId;

/// Errors that can occur during socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Host could not be resolved to any address.
    AddressResolution {
        /// Host as given by the controller.
        host: String,
        /// Resolver message.
        reason: String,
    },
    /// Listener could not acquire the requested address/port.
    Bind {
        /// Address the bind was attempted on.
        address: SocketAddr,
        /// OS message (address in use, permission denied, ...).
        reason: String,
    },
    /// Peer actively refused the connection.
    ConnectionRefused {
        /// Address that refused.
        address: SocketAddr,
    },
    /// Connect attempt did not finish in time.
    ConnectionTimeout {
        /// Address that was being connected to.
        address: SocketAddr,
    },
    /// Connect failed, or an active connection broke.
    Connection(String),
    /// Operation referenced an id with no entry. Only returned by calls
    /// that report back directly; `write`/`close` stay silent.
    UnknownId(ConnectionId),
    /// Id is already pending or registered.
    DuplicateId(ConnectionId),
    /// Accept-id counter ran past the end of the id range.
    AcceptIdsExhausted,
    /// Socket closed before the operation completed.
    Closed,
}

impl SocketError {
    /// Classifies an I/O error from a connect attempt against `address`.
    pub(crate) fn from_connect(address: SocketAddr, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { address },
            io::ErrorKind::TimedOut => Self::ConnectionTimeout { address },
            _ => Self::Connection(format!("{address}: {err}")),
        }
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressResolution { host, reason } => {
                write!(f, "Failed to resolve host '{host}': {reason}")
            }
            Self::Bind { address, reason } => write!(f, "Failed to bind {address}: {reason}"),
            Self::ConnectionRefused { address } => write!(f, "Connection refused: {address}"),
            Self::ConnectionTimeout { address } => write!(f, "Connection timed out: {address}"),
            Self::Connection(msg) => write!(f, "Connection error: {msg}"),
            Self::UnknownId(id) => write!(f, "Unknown connection id {id}"),
            Self::DuplicateId(id) => write!(f, "Connection id {id} is already in use"),
            Self::AcceptIdsExhausted => write!(f, "No connection ids left for accepted sockets"),
            Self::Closed => write!(f, "Socket closed"),
        }
    }
}

impl std::error::Error for SocketError {}
