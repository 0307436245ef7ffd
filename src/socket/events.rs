//! Normalized, id-tagged socket events.

use bytes::Bytes;
use serde::Serialize;

use super::{ConnectionId, SocketAddress};

/// Event delivered to the [`super::SocketEventSink`].
///
/// Serializes as `{"event": <name>, "id": .., ...}` for boundary layers.
/// `Data` payloads serialize as raw byte arrays; any text-safe encoding is
/// the boundary's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SocketEvent {
    /// A listening socket accepted a new connection.
    #[serde(rename_all = "camelCase")]
    Connection {
        /// Id of the listening socket.
        server_id: ConnectionId,
        /// Id allocated for the accepted connection.
        client_id: ConnectionId,
        /// Peer address of the accepted connection.
        address: SocketAddress,
    },
    /// A connect finished, or a listener is now accepting.
    Connect {
        /// Connection id.
        id: ConnectionId,
        /// Peer address for connections, bound address for listeners.
        address: SocketAddress,
    },
    /// Bytes arrived, exactly as read from the socket.
    Data {
        /// Connection id.
        id: ConnectionId,
        /// Received bytes.
        bytes: Bytes,
    },
    /// Terminal event: the id is gone from the registry.
    #[serde(rename_all = "camelCase")]
    Close {
        /// Connection id.
        id: ConnectionId,
        /// Whether an `Error` preceded this close.
        had_error: bool,
    },
    /// A failure scoped to this id.
    Error {
        /// Connection id.
        id: ConnectionId,
        /// Human-readable message.
        message: String,
    },
    /// Idle timeout fired; the socket is being destroyed.
    Timeout {
        /// Connection id.
        id: ConnectionId,
    },
}

impl SocketEvent {
    /// The id this event concerns (the server id for `Connection`).
    pub fn id(&self) -> ConnectionId {
        match self {
            Self::Connection { server_id, .. } => *server_id,
            Self::Connect { id, .. }
            | Self::Data { id, .. }
            | Self::Close { id, .. }
            | Self::Error { id, .. }
            | Self::Timeout { id } => *id,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Connect { .. } => "connect",
            Self::Data { .. } => "data",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Returns `true` for `Close`, the last event an id ever gets.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close { .. })
    }
}
