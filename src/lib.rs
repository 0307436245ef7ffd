//! sockmux - TCP socket multiplexer.
//!
//! Lets a controlling application open, accept, read from, write to, and
//! close many TCP connections and listening sockets at once. Every socket
//! is addressed by a small integer id, and every lifecycle or data event
//! comes back on a single event sink tagged with that id.
//!
//! # Architecture
//!
//! ```text
//! Controller                     SocketManager                    OS
//! ┌────────────┐  listen/connect  ┌──────────────────┐   tokio    ┌─────────┐
//! │            │─────────────────►│ Registry (Mutex) │◄──tasks───►│ TCP     │
//! │            │  write/close     │  id → Entry      │            │ sockets │
//! │            │◄─────────────────│ SocketEventSink  │            └─────────┘
//! └────────────┘   SocketEvent    └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`socket`] - Socket manager, transport adapters, and events
//! - [`config`] - Configuration loading
//! - [`constants`] - Default values

pub mod config;
pub mod constants;
pub mod socket;

pub use config::Config;
pub use socket::{
    event_channel, weak_sink, AddressFamily, ChannelSink, ConnectOptions, ConnectionId,
    SocketAddress, SocketError, SocketEvent, SocketEventSink, SocketManager, WriteReceipt,
};
