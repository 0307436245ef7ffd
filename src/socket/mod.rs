//! TCP socket multiplexing over integer connection ids.
//!
//! The [`SocketManager`] owns every live socket in a registry keyed by
//! [`ConnectionId`], drives their I/O on tokio tasks, and republishes raw
//! transport activity as id-tagged [`SocketEvent`]s on one
//! [`SocketEventSink`].
//!
//! # Architecture
//!
//! ```text
//! SocketManager ──reserve/commit──► Registry ◄──remove── TransportObserver
//!      │                               │                        ▲
//!      │ spawn                         │ Entry                  │ TransportEvent
//!      ▼                               ▼                        │
//! ListeningSocket / ConnectedSocket (tokio tasks) ──────────────┘
//!      │
//!      └──► SocketEventSink (weak) ──► controller
//! ```
//!
//! # Event ordering
//!
//! Events are delivered while the registry lock is held, so events for one
//! id arrive in adapter order and nothing for an id follows its `Close`.
//! Events for different ids have no relative ordering.

pub mod address;
pub mod error;
pub mod events;
pub mod manager;
pub(crate) mod registry;
pub mod sink;
pub(crate) mod transport;

pub use address::{AddressFamily, SocketAddress};
pub use error::SocketError;
pub use events::SocketEvent;
pub use manager::{ConnectOptions, SocketManager, WriteReceipt};
pub use sink::{event_channel, weak_sink, ChannelSink, SocketEventSink};

/// Integer handle identifying one socket or listening socket.
pub type ConnectionId = u32;
