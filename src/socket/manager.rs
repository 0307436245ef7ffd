//! The socket manager: registry owner and event normalizer.
//!
//! Controller operations and adapter callbacks run on different tasks and
//! all meet at one mutex around the [`Registry`]. Events are handed to the
//! sink while that mutex is held, which is what keeps per-id ordering and
//! guarantees nothing is emitted for an id after its `Close`.
//!
//! Rust guideline compliant 2026-02

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use super::address;
use super::registry::{Entry, Registry};
use super::sink::{weak_sink, SinkHandle};
use super::transport::{
    ConnectedSocket, ConnectionSettings, ListeningSocket, SocketKey, TransportEvent,
    TransportObserver,
};
use super::{ConnectionId, SocketAddress, SocketError, SocketEvent, SocketEventSink};
use crate::config::Config;

/// Extra time [`SocketManager::shutdown`] allows beyond the close timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Options for [`SocketManager::connect_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Host to connect to. `None` or blank means `localhost`.
    pub host: Option<String>,
    /// Port to connect to.
    pub port: u16,
    /// Local address to bind before connecting.
    pub local_address: Option<IpAddr>,
    /// Local port to bind before connecting.
    pub local_port: Option<u16>,
    /// `TCP_NODELAY`; falls back to [`Config::no_delay`].
    pub no_delay: Option<bool>,
    /// `SO_KEEPALIVE`; falls back to [`Config::keep_alive`].
    pub keep_alive: Option<bool>,
}

impl ConnectOptions {
    /// Options for a plain connect to `host:port`.
    pub fn new(host: Option<&str>, port: u16) -> Self {
        Self {
            host: host.map(str::to_owned),
            port,
            ..Self::default()
        }
    }
}

/// Completion handle for [`SocketManager::write_with_receipt`].
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl WriteReceipt {
    /// Waits until the bytes were handed to the OS.
    ///
    /// Fails with [`SocketError::Closed`] if the socket closed first.
    pub async fn wait(self) -> Result<(), SocketError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SocketError::Connection(e.to_string())),
            Err(_) => Err(SocketError::Closed),
        }
    }
}

/// Owns every socket and listening socket, keyed by [`ConnectionId`].
///
/// Cheap to clone; clones share one registry. No method blocks on network
/// I/O: outcomes arrive as [`SocketEvent`]s on the sink.
#[derive(Clone)]
pub struct SocketManager {
    shared: Arc<Shared>,
}

struct Shared {
    registry: Mutex<Registry>,
    sink: SinkHandle,
    config: Config,
    /// Settings for every connection, including the tracker all adapter
    /// and completion tasks are spawned on.
    settings: ConnectionSettings,
    runtime: Handle,
    /// Back-reference handed to adapters as their observer.
    this: Weak<Shared>,
}

impl SocketManager {
    /// Creates a manager on the current tokio runtime.
    ///
    /// The manager only keeps a weak reference to `sink`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new<S: SocketEventSink + 'static>(sink: &Arc<S>, config: Config) -> Self {
        Self::with_runtime(Handle::current(), weak_sink(sink), config)
    }

    /// Creates a manager that spawns its tasks on `runtime`.
    ///
    /// Takes the sink already downgraded, so trait-object sinks work too:
    /// pass `Arc::downgrade(&sink)` for an `Arc<dyn SocketEventSink>`.
    pub fn with_runtime(runtime: Handle, sink: Weak<dyn SocketEventSink>, config: Config) -> Self {
        let settings = ConnectionSettings {
            read_buffer_size: config.read_buffer_size,
            linger: config.close_timeout(),
            tasks: TaskTracker::new(),
        };
        let shared = Arc::new_cyclic(|this| Shared {
            registry: Mutex::new(Registry::new(config.accept_id_seed)),
            sink: SinkHandle::new(sink),
            config,
            settings,
            runtime,
            this: this.clone(),
        });
        Self { shared }
    }

    /// Starts listening on `host:port` under `id`.
    ///
    /// Emits `Connect{id, boundAddress}` once bound, then a `Connection`
    /// per accepted peer. Resolution and bind failures emit `Error{id}`.
    pub fn listen(&self, id: ConnectionId, host: Option<&str>, port: u16) {
        let Some(key) = self.shared.reserve(id) else {
            return;
        };
        let host = host.map(str::to_owned);
        let shared = Arc::clone(&self.shared);

        log::debug!("[SocketManager] Listen {} on {:?}:{}", id, host, port);
        self.shared.spawn(async move {
            let result = bind(host.as_deref(), port).await;
            shared.complete_listen(key, result);
        });
    }

    /// Connects to `host:port` under `id`.
    ///
    /// Emits `Connect{id, peerAddress}` on success, `Error{id}` on failure.
    pub fn connect(&self, id: ConnectionId, host: Option<&str>, port: u16) {
        self.connect_with(id, ConnectOptions::new(host, port));
    }

    /// Connects under `id` with explicit options.
    pub fn connect_with(&self, id: ConnectionId, options: ConnectOptions) {
        let Some(key) = self.shared.reserve(id) else {
            return;
        };
        let shared = Arc::clone(&self.shared);

        log::debug!(
            "[SocketManager] Connect {} to {:?}:{}",
            id,
            options.host,
            options.port
        );
        self.shared.spawn(async move {
            let result = establish(&options, &shared.config).await;
            shared.complete_connect(key, result);
        });
    }

    /// Queues `bytes` for transmission on `id`.
    ///
    /// Silently ignored if `id` is unknown or not a connection.
    pub fn write(&self, id: ConnectionId, bytes: impl Into<Bytes>) {
        let registry = self.shared.lock();
        match registry.get(id) {
            Some(Entry::Connected(socket)) => {
                socket.write(bytes.into(), None);
            }
            _ => log::trace!("[SocketManager] Write to unknown connection {}", id),
        }
    }

    /// Like [`write`](Self::write), but reports when the bytes reached the OS.
    ///
    /// Fails with [`SocketError::UnknownId`] if `id` is unknown or not a
    /// connection.
    pub fn write_with_receipt(
        &self,
        id: ConnectionId,
        bytes: impl Into<Bytes>,
    ) -> Result<WriteReceipt, SocketError> {
        let registry = self.shared.lock();
        let Some(Entry::Connected(socket)) = registry.get(id) else {
            return Err(SocketError::UnknownId(id));
        };
        let (tx, rx) = oneshot::channel();
        socket.write(bytes.into(), Some(tx));
        Ok(WriteReceipt { rx })
    }

    /// Gracefully closes `id`.
    ///
    /// Connections flush queued writes first, for at most
    /// [`Config::close_timeout`]; after that the socket is destroyed. Listeners stop accepting;
    /// connections they accepted stay open. A `Close` event follows.
    /// No-op for unknown ids.
    pub fn close(&self, id: ConnectionId) {
        let registry = self.shared.lock();
        match registry.get(id) {
            Some(entry) => {
                log::debug!("[SocketManager] Closing {}", id);
                entry.close();
            }
            None => log::trace!("[SocketManager] Close on unknown id {}", id),
        }
    }

    /// Closes `id` immediately, discarding queued writes.
    pub fn destroy(&self, id: ConnectionId) {
        let registry = self.shared.lock();
        match registry.get(id) {
            Some(Entry::Connected(socket)) => socket.destroy(),
            Some(Entry::Listening(listener)) => listener.stop(),
            None => log::trace!("[SocketManager] Destroy on unknown id {}", id),
        }
    }

    /// Closes every registered socket and empties the registry.
    ///
    /// A `Close` is emitted for each entry before this returns.
    /// Connections keep flushing in the background, bounded by
    /// [`Config::close_timeout`]; use [`shutdown`](Self::shutdown) to wait
    /// for that. Listens and connects still in flight are discarded when
    /// they complete. Safe to call repeatedly.
    pub fn close_all_sockets(&self) {
        let mut registry = self.shared.lock();
        let drained = registry.drain();
        if drained.is_empty() {
            return;
        }

        log::info!("[SocketManager] Closing all {} sockets", drained.len());
        for (id, entry) in drained {
            entry.close_detached();
            self.shared.emit(SocketEvent::Close {
                id,
                had_error: false,
            });
        }
    }

    /// Closes every socket like [`close_all_sockets`](Self::close_all_sockets),
    /// then waits for their flushes and tasks to finish.
    ///
    /// Waits at most [`Config::close_timeout`] plus a short grace period;
    /// tasks still running after that (a connect in flight, say) are left
    /// to finish on their own.
    pub async fn shutdown(&self) {
        self.close_all_sockets();

        let tasks = &self.shared.settings.tasks;
        tasks.close();
        let limit = self.shared.config.close_timeout() + SHUTDOWN_GRACE;
        if tokio::time::timeout(limit, tasks.wait()).await.is_err() {
            log::warn!(
                "[SocketManager] {} tasks still running after shutdown",
                tasks.len()
            );
        }
        tasks.reopen();
    }

    /// Sets an idle timeout on connection `id`; `None` clears it.
    ///
    /// When no data arrives for `timeout`, emits `Timeout{id}` and
    /// destroys the socket. Fails with [`SocketError::UnknownId`] if `id`
    /// is not a connection.
    pub fn set_timeout(
        &self,
        id: ConnectionId,
        timeout: Option<Duration>,
    ) -> Result<(), SocketError> {
        let registry = self.shared.lock();
        match registry.get(id) {
            Some(Entry::Connected(socket)) => {
                socket.set_idle_timeout(timeout);
                Ok(())
            }
            _ => Err(SocketError::UnknownId(id)),
        }
    }

    /// Address reported for `id`: the bound address of a listener, the
    /// peer address of a connection.
    pub fn address(&self, id: ConnectionId) -> Option<SocketAddress> {
        self.shared.lock().get(id).map(|entry| entry.address().clone())
    }

    /// Returns `true` if `id` has a live entry.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.shared.lock().contains(id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    /// Returns `true` if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points event delivery at `sink` (held weakly).
    pub fn attach_sink<S: SocketEventSink + 'static>(&self, sink: &Arc<S>) {
        self.attach_weak_sink(weak_sink(sink));
    }

    /// Like [`attach_sink`](Self::attach_sink), for a sink that is already
    /// downgraded, e.g. `Arc::downgrade(&arc_dyn_sink)`.
    pub fn attach_weak_sink(&self, sink: Weak<dyn SocketEventSink>) {
        self.shared.sink.attach(sink);
    }

    /// Stops event delivery. Sockets keep running; events are dropped.
    pub fn detach_sink(&self) {
        self.shared.sink.detach();
    }

    /// Configuration this manager was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("entries", &self.len())
            .field("sink", &self.shared.sink)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.settings.tasks.spawn_on(task, &self.runtime);
    }

    fn emit(&self, event: SocketEvent) {
        self.sink.deliver(event);
    }

    fn observer(&self) -> Weak<dyn TransportObserver> {
        self.this.clone()
    }

    /// Reserves `id`, reporting a duplicate as an `Error` event.
    fn reserve(&self, id: ConnectionId) -> Option<SocketKey> {
        let mut registry = self.lock();
        match registry.reserve(id) {
            Ok(key) => Some(key),
            Err(e) => {
                log::error!("[SocketManager] {e}");
                self.emit(SocketEvent::Error {
                    id,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn complete_listen(&self, key: SocketKey, result: Result<TcpListener, SocketError>) {
        let mut registry = self.lock();

        let listener = match result {
            Ok(listener) => listener,
            Err(e) => {
                self.fail_pending(&mut registry, key, &e);
                return;
            }
        };
        if !registry.is_pending(key) {
            log::debug!(
                "[SocketManager] Listen {} completed after shutdown, discarding",
                key.id
            );
            return;
        }

        match ListeningSocket::spawn(listener, key, self.observer(), &self.settings.tasks) {
            Ok(listening) => {
                let address = listening.local_address().clone();
                match registry.commit(key, Entry::Listening(listening)) {
                    Ok(()) => {
                        log::info!("[SocketManager] Listener {} bound to {}", key.id, address);
                        self.emit(SocketEvent::Connect {
                            id: key.id,
                            address,
                        });
                    }
                    Err(entry) => entry.close_detached(),
                }
            }
            Err(e) => self.fail_pending(&mut registry, key, &SocketError::Connection(e.to_string())),
        }
    }

    fn complete_connect(&self, key: SocketKey, result: Result<TcpStream, SocketError>) {
        let mut registry = self.lock();

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_pending(&mut registry, key, &e);
                return;
            }
        };
        if !registry.is_pending(key) {
            log::debug!(
                "[SocketManager] Connect {} completed after shutdown, discarding",
                key.id
            );
            return;
        }

        match ConnectedSocket::spawn(stream, key, self.observer(), &self.settings) {
            Ok(socket) => {
                let address = socket.peer_address().clone();
                log::info!(
                    "[SocketManager] Connection {} established {} -> {}",
                    key.id,
                    socket.local_address(),
                    address
                );
                match registry.commit(key, Entry::Connected(socket)) {
                    Ok(()) => self.emit(SocketEvent::Connect {
                        id: key.id,
                        address,
                    }),
                    Err(entry) => entry.close_detached(),
                }
            }
            Err(e) => self.fail_pending(&mut registry, key, &SocketError::Connection(e.to_string())),
        }
    }

    /// Drops a failed reservation and reports it, unless shutdown already
    /// discarded it.
    fn fail_pending(&self, registry: &mut Registry, key: SocketKey, err: &SocketError) {
        if registry.release(key) {
            log::warn!("[SocketManager] Socket {} failed: {err}", key.id);
            self.emit(SocketEvent::Error {
                id: key.id,
                message: err.to_string(),
            });
        } else {
            log::debug!(
                "[SocketManager] Socket {} failed after shutdown, discarding: {err}",
                key.id
            );
        }
    }

    fn on_accepted(&self, server: SocketKey, stream: TcpStream, peer: SocketAddr) {
        let mut registry = self.lock();

        if !matches!(registry.get_current(server), Some(Entry::Listening(_))) {
            log::debug!(
                "[SocketManager] Listener {} gone, dropping connection from {}",
                server.id,
                peer
            );
            return;
        }

        let key = match registry.allocate_accept_key() {
            Ok(key) => key,
            Err(e) => {
                log::error!("[SocketManager] Listener {}: {e}", server.id);
                self.emit(SocketEvent::Error {
                    id: server.id,
                    message: e.to_string(),
                });
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            log::debug!("[SocketManager] set_nodelay failed for {}: {e}", key.id);
        }

        match ConnectedSocket::spawn(stream, key, self.observer(), &self.settings) {
            Ok(socket) => {
                registry.insert_accepted(key, Entry::Connected(socket));
                let address = SocketAddress::from(peer);
                log::info!(
                    "[SocketManager] Listener {} accepted {} from {}",
                    server.id,
                    key.id,
                    address
                );
                self.emit(SocketEvent::Connection {
                    server_id: server.id,
                    client_id: key.id,
                    address,
                });
            }
            Err(e) => {
                log::warn!("[SocketManager] Dropping accepted connection from {peer}: {e}");
            }
        }
    }

    /// Emits `event` only if `key` is still the live registration.
    fn emit_if_current(&self, key: SocketKey, event: SocketEvent) {
        let registry = self.lock();
        if registry.get_current(key).is_some() {
            self.emit(event);
        } else {
            log::trace!(
                "[SocketManager] Dropping {} event for stale socket {}",
                event.name(),
                key.id
            );
        }
    }
}

impl TransportObserver for Shared {
    fn on_transport_event(&self, key: SocketKey, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { stream, peer } => self.on_accepted(key, stream, peer),
            TransportEvent::Data(bytes) => {
                self.emit_if_current(key, SocketEvent::Data { id: key.id, bytes });
            }
            TransportEvent::Timeout => {
                log::info!("[SocketManager] Connection {} idle timeout", key.id);
                self.emit_if_current(key, SocketEvent::Timeout { id: key.id });
            }
            TransportEvent::Error(message) => {
                log::warn!("[SocketManager] Socket {} error: {message}", key.id);
                self.emit_if_current(key, SocketEvent::Error {
                    id: key.id,
                    message,
                });
            }
            TransportEvent::Closed { had_error } => {
                let mut registry = self.lock();
                if registry.remove_current(key).is_some() {
                    log::info!("[SocketManager] Socket {} closed", key.id);
                    self.emit(SocketEvent::Close {
                        id: key.id,
                        had_error,
                    });
                }
            }
        }
    }
}

/// Binds the first candidate address that works.
async fn bind(host: Option<&str>, port: u16) -> Result<TcpListener, SocketError> {
    let mut last_error = None;
    for address in address::resolve_bind(host, port).await? {
        match TcpListener::bind(address).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                log::debug!("[SocketManager] Bind {address} failed: {e}");
                last_error = Some(SocketError::Bind {
                    address,
                    reason: e.to_string(),
                });
            }
        }
    }
    Err(last_error.unwrap_or_else(|| SocketError::Connection("no address to bind".into())))
}

/// Resolves and connects, trying each resolved address in turn.
async fn establish(options: &ConnectOptions, config: &Config) -> Result<TcpStream, SocketError> {
    let candidates = address::resolve_connect(options.host.as_deref(), options.port).await?;
    let timeout = config.connect_timeout();
    let keep_alive = options.keep_alive.unwrap_or(config.keep_alive);
    let no_delay = options.no_delay.unwrap_or(config.no_delay);

    let mut last_error = None;
    for address in candidates {
        match tokio::time::timeout(timeout, connect_one(address, options, keep_alive)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(no_delay) {
                    log::debug!("[SocketManager] set_nodelay failed for {address}: {e}");
                }
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = Some(SocketError::from_connect(address, &e)),
            Err(_) => last_error = Some(SocketError::ConnectionTimeout { address }),
        }
    }
    Err(last_error.unwrap_or_else(|| SocketError::Connection("no address to connect to".into())))
}

async fn connect_one(
    address: SocketAddr,
    options: &ConnectOptions,
    keep_alive: bool,
) -> io::Result<TcpStream> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if options.local_address.is_some() || options.local_port.is_some() {
        let ip = options.local_address.unwrap_or(if address.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
        socket.bind(SocketAddr::new(ip, options.local_port.unwrap_or(0)))?;
    }
    socket.set_keepalive(keep_alive)?;
    socket.connect(address).await
}
