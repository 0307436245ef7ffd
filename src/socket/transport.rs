//! Transport adapters: one per OS-level TCP socket.
//!
//! A [`ConnectedSocket`] runs a read task and a write task; a
//! [`ListeningSocket`] runs an accept loop. Both report raw
//! [`TransportEvent`]s to a single [`TransportObserver`], held weakly so a
//! dropped manager doesn't keep sockets alive.
//!
//! Each adapter reports exactly one `Closed` event, always last.
//! Dropping an adapter cancels its tasks. Tasks are spawned on a
//! [`TaskTracker`] so their owner can wait for them to finish.

use std::io;
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use super::{ConnectionId, SocketAddress};

/// Identifies one registration of an id.
///
/// The serial differs every time an id is (re)registered, so events from
/// an adapter that outlived its entry can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketKey {
    pub(crate) id: ConnectionId,
    pub(crate) serial: u64,
}

/// Raw event fired by an adapter.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// Listener accepted a connection. The observer takes ownership.
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// Bytes read from the socket.
    Data(Bytes),
    /// Idle timeout elapsed with no inbound data.
    Timeout,
    /// Read, write, or accept failure. Always followed by `Closed`.
    Error(String),
    /// Adapter is done. Last event for this key.
    Closed { had_error: bool },
}

/// Receives every raw event from the adapters it created.
pub(crate) trait TransportObserver: Send + Sync {
    fn on_transport_event(&self, key: SocketKey, event: TransportEvent);
}

/// Delivers to the observer. Returns `false` once the observer is gone.
fn notify(observer: &Weak<dyn TransportObserver>, key: SocketKey, event: TransportEvent) -> bool {
    match observer.upgrade() {
        Some(observer) => {
            observer.on_transport_event(key, event);
            true
        }
        None => false,
    }
}

// =============================================================================
// Connected socket
// =============================================================================

/// Result of a write or flush, reported back through a receipt.
pub(crate) type WriteAck = oneshot::Sender<io::Result<()>>;

#[derive(Debug)]
enum WriteCommand {
    Data { bytes: Bytes, ack: Option<WriteAck> },
    /// Flush queued data, shut down the write half, then close.
    End,
}

/// How a connection's tasks finished.
#[derive(Debug)]
enum Outcome {
    PeerClosed,
    Ended,
    /// Graceful close ran out of time flushing.
    LingerExpired,
    Destroyed,
    TimedOut,
    Failed(String),
}

/// Per-connection settings shared by every socket a manager spawns.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) read_buffer_size: usize,
    /// Upper bound on flushing after `end()`.
    pub(crate) linger: Duration,
    pub(crate) tasks: TaskTracker,
}

/// Adapter for one established TCP connection.
pub(crate) struct ConnectedSocket {
    local: SocketAddress,
    peer: SocketAddress,
    commands: UnboundedSender<WriteCommand>,
    idle_timeout: watch::Sender<Option<Duration>>,
    /// Cancelled once a graceful close starts; arms the linger deadline.
    ending: CancellationToken,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
}

impl ConnectedSocket {
    /// Takes over `stream` and starts its read and write tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        stream: TcpStream,
        key: SocketKey,
        observer: Weak<dyn TransportObserver>,
        settings: &ConnectionSettings,
    ) -> io::Result<Self> {
        let local = SocketAddress::from(stream.local_addr()?);
        let peer = SocketAddress::from(stream.peer_addr()?);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (idle_timeout, idle_rx) = watch::channel(None);
        let ending = CancellationToken::new();
        let cancel = CancellationToken::new();

        settings.tasks.spawn(run_connection(
            Connection {
                key,
                stream,
                observer,
                commands: commands_rx,
                idle_rx,
            },
            Shutdown {
                ending: ending.clone(),
                cancel: cancel.clone(),
                linger: settings.linger,
            },
            settings.read_buffer_size,
        ));

        Ok(Self {
            local,
            peer,
            commands,
            idle_timeout,
            ending,
            guard: Some(cancel.clone().drop_guard()),
            cancel,
        })
    }

    pub(crate) fn peer_address(&self) -> &SocketAddress {
        &self.peer
    }

    pub(crate) fn local_address(&self) -> &SocketAddress {
        &self.local
    }

    /// Queues `bytes` for the write task. Returns `false` if the write
    /// side has already finished.
    pub(crate) fn write(&self, bytes: Bytes, ack: Option<WriteAck>) -> bool {
        self.commands.send(WriteCommand::Data { bytes, ack }).is_ok()
    }

    /// Graceful close: flush queued writes, then close.
    ///
    /// If flushing takes longer than the linger, the socket is destroyed.
    pub(crate) fn end(&self) {
        self.ending.cancel();
        let _ = self.commands.send(WriteCommand::End);
    }

    /// Immediate close: queued writes are discarded.
    pub(crate) fn destroy(&self) {
        self.cancel.cancel();
    }

    /// Sets or clears the idle timeout. Takes effect immediately.
    pub(crate) fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.idle_timeout.send_replace(timeout);
    }

    /// Ends the socket and lets its tasks finish on their own, without
    /// the drop-time cancellation.
    pub(crate) fn end_detached(mut self) {
        self.end();
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
    }
}

impl std::fmt::Debug for ConnectedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// The socket and channels a connection task runs on.
struct Connection {
    key: SocketKey,
    stream: TcpStream,
    observer: Weak<dyn TransportObserver>,
    commands: UnboundedReceiver<WriteCommand>,
    idle_rx: watch::Receiver<Option<Duration>>,
}

/// Signals that end a connection task from the outside.
struct Shutdown {
    ending: CancellationToken,
    cancel: CancellationToken,
    linger: Duration,
}

async fn run_connection(connection: Connection, shutdown: Shutdown, read_buffer_size: usize) {
    let Connection {
        key,
        stream,
        observer,
        commands,
        idle_rx,
    } = connection;
    let (reader, writer) = stream.into_split();
    let mut write_task = tokio::spawn(write_loop(writer, commands));

    let outcome = tokio::select! {
        biased;
        () = shutdown.cancel.cancelled() => Outcome::Destroyed,
        joined = &mut write_task => match joined {
            Ok(Ok(())) => Outcome::Ended,
            Ok(Err(e)) => Outcome::Failed(e.to_string()),
            Err(e) => Outcome::Failed(format!("write task failed: {e}")),
        },
        outcome = read_loop(key, reader, &observer, idle_rx, read_buffer_size) => outcome,
        () = linger_expiry(&shutdown.ending, shutdown.linger) => Outcome::LingerExpired,
    };
    write_task.abort();

    log::debug!("[Transport] Connection {} finished: {:?}", key.id, outcome);

    match outcome {
        Outcome::Failed(message) => {
            notify(&observer, key, TransportEvent::Error(message));
            notify(&observer, key, TransportEvent::Closed { had_error: true });
        }
        Outcome::TimedOut => {
            notify(&observer, key, TransportEvent::Timeout);
            notify(&observer, key, TransportEvent::Closed { had_error: false });
        }
        Outcome::LingerExpired => {
            log::warn!(
                "[Transport] Connection {} did not flush within {:?}, destroyed",
                key.id,
                shutdown.linger
            );
            notify(&observer, key, TransportEvent::Closed { had_error: false });
        }
        Outcome::PeerClosed | Outcome::Ended | Outcome::Destroyed => {
            notify(&observer, key, TransportEvent::Closed { had_error: false });
        }
    }
}

async fn read_loop(
    key: SocketKey,
    mut reader: OwnedReadHalf,
    observer: &Weak<dyn TransportObserver>,
    mut idle_rx: watch::Receiver<Option<Duration>>,
    read_buffer_size: usize,
) -> Outcome {
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        let idle = *idle_rx.borrow_and_update();

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return Outcome::PeerClosed,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if !notify(observer, key, TransportEvent::Data(data)) {
                        return Outcome::Destroyed;
                    }
                }
                Err(e) => return Outcome::Failed(e.to_string()),
            },
            // New timeout value: restart the wait with it.
            Ok(()) = idle_rx.changed() => {}
            () = idle_expiry(idle) => return Outcome::TimedOut,
        }
    }
}

/// Resolves `linger` after a graceful close starts.
async fn linger_expiry(ending: &CancellationToken, linger: Duration) {
    ending.cancelled().await;
    tokio::time::sleep(linger).await;
}

async fn idle_expiry(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: UnboundedReceiver<WriteCommand>,
) -> io::Result<()> {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Data { bytes, ack } => {
                if let Err(e) = writer.write_all(&bytes).await {
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(io::Error::new(e.kind(), e.to_string())));
                    }
                    return Err(e);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            WriteCommand::End => {
                writer.shutdown().await?;
                return Ok(());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Listening socket
// =============================================================================

/// Adapter for one listening socket.
pub(crate) struct ListeningSocket {
    local: SocketAddress,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ListeningSocket {
    /// Takes over `listener` and starts its accept loop.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        listener: TcpListener,
        key: SocketKey,
        observer: Weak<dyn TransportObserver>,
        tasks: &TaskTracker,
    ) -> io::Result<Self> {
        let local = SocketAddress::from(listener.local_addr()?);
        let cancel = CancellationToken::new();

        tasks.spawn(accept_loop(key, listener, observer, cancel.clone()));

        Ok(Self {
            local,
            _guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    pub(crate) fn local_address(&self) -> &SocketAddress {
        &self.local
    }

    /// Stops accepting. Already-accepted connections are unaffected.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ListeningSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningSocket")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    key: SocketKey,
    listener: TcpListener,
    observer: Weak<dyn TransportObserver>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("[Transport] Listener {} stopped", key.id);
                notify(&observer, key, TransportEvent::Closed { had_error: false });
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !notify(&observer, key, TransportEvent::Accepted { stream, peer }) {
                        return;
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    log::warn!("[Transport] Listener {} accept error (ignored): {e}", key.id);
                }
                Err(e) => {
                    log::error!("[Transport] Listener {} accept failed: {e}", key.id);
                    notify(&observer, key, TransportEvent::Error(e.to_string()));
                    notify(&observer, key, TransportEvent::Closed { had_error: true });
                    return;
                }
            }
        }
    }
}

/// Errors that concern one half-accepted peer, not the listener itself.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    /// Forwards every transport event into a channel.
    struct Recorder {
        tx: UnboundedSender<(SocketKey, TransportEvent)>,
    }

    impl TransportObserver for Recorder {
        fn on_transport_event(&self, key: SocketKey, event: TransportEvent) {
            let _ = self.tx.send((key, event));
        }
    }

    fn recorder() -> (Arc<Recorder>, UnboundedReceiver<(SocketKey, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn TransportObserver> {
        let observer: Arc<dyn TransportObserver> = recorder.clone();
        Arc::downgrade(&observer)
    }

    async fn next(rx: &mut UnboundedReceiver<(SocketKey, TransportEvent)>) -> TransportEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for transport event")
            .expect("Channel closed")
            .1
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    const KEY: SocketKey = SocketKey { id: 7, serial: 1 };

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            read_buffer_size: 1024,
            linger: WAIT,
            tasks: TaskTracker::new(),
        }
    }

    #[tokio::test]
    async fn test_data_flows_both_ways_then_peer_close() {
        let (recorder, mut rx) = recorder();
        let (ours, mut peer) = connected_pair().await;
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings()).unwrap();
        assert_eq!(socket.peer_address().port, peer.local_addr().unwrap().port());

        peer.write_all(b"ping").await.unwrap();
        match next(&mut rx).await {
            TransportEvent::Data(data) => assert_eq!(&data[..], b"ping"),
            other => panic!("Expected Data, got: {other:?}"),
        }

        assert!(socket.write(Bytes::from_static(b"pong"), None));
        let mut buf = [0u8; 4];
        tokio::time::timeout(WAIT, peer.read_exact(&mut buf))
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(&buf, b"pong");

        drop(peer);
        match next(&mut rx).await {
            TransportEvent::Closed { had_error } => assert!(!had_error),
            other => panic!("Expected Closed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_flushes_queued_writes_before_closing() {
        let (recorder, mut rx) = recorder();
        let (ours, mut peer) = connected_pair().await;
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings()).unwrap();

        let (ack_tx, ack_rx) = oneshot::channel();
        socket.write(Bytes::from_static(b"last words"), Some(ack_tx));
        socket.end();

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, peer.read_to_end(&mut received))
            .await
            .expect("Timed out")
            .unwrap();
        assert_eq!(received, b"last words");
        assert!(ack_rx.await.unwrap().is_ok());

        match next(&mut rx).await {
            TransportEvent::Closed { had_error } => assert!(!had_error),
            other => panic!("Expected Closed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_gives_up_on_peer_that_never_reads() {
        let (recorder, mut rx) = recorder();
        let (ours, _peer) = connected_pair().await;
        let settings = ConnectionSettings {
            linger: Duration::from_millis(100),
            ..settings()
        };
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings).unwrap();

        // Far more than the kernel buffers on both ends can hold.
        socket.write(Bytes::from(vec![0u8; 32 * 1024 * 1024]), None);
        socket.end();

        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::Closed { had_error: false }
        ));
    }

    #[tokio::test]
    async fn test_tracker_waits_for_connection_tasks() {
        let (recorder, mut rx) = recorder();
        let (ours, _peer) = connected_pair().await;
        let settings = settings();
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings).unwrap();

        socket.end();
        settings.tasks.close();
        tokio::time::timeout(WAIT, settings.tasks.wait())
            .await
            .expect("Timed out waiting for tasks");
        assert!(matches!(next(&mut rx).await, TransportEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_destroy_closes_without_error() {
        let (recorder, mut rx) = recorder();
        let (ours, _peer) = connected_pair().await;
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings()).unwrap();

        socket.destroy();
        match next(&mut rx).await {
            TransportEvent::Closed { had_error } => assert!(!had_error),
            other => panic!("Expected Closed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_fires_then_closes() {
        let (recorder, mut rx) = recorder();
        let (ours, _peer) = connected_pair().await;
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings()).unwrap();

        socket.set_idle_timeout(Some(Duration::from_millis(50)));
        assert!(matches!(next(&mut rx).await, TransportEvent::Timeout));
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::Closed { had_error: false }
        ));
    }

    #[tokio::test]
    async fn test_dropping_adapter_cancels_tasks() {
        let (recorder, mut rx) = recorder();
        let (ours, _peer) = connected_pair().await;
        let socket = ConnectedSocket::spawn(ours, KEY, weak(&recorder), &settings()).unwrap();

        drop(socket);
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::Closed { had_error: false }
        ));
    }

    #[tokio::test]
    async fn test_listener_reports_accepts_and_stop() {
        let (recorder, mut rx) = recorder();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listening =
            ListeningSocket::spawn(listener, KEY, weak(&recorder), &TaskTracker::new()).unwrap();
        let port = listening.local_address().port;

        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        match next(&mut rx).await {
            TransportEvent::Accepted { peer, .. } => {
                assert_eq!(peer, client.local_addr().unwrap());
            }
            other => panic!("Expected Accepted, got: {other:?}"),
        }

        listening.stop();
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::Closed { had_error: false }
        ));
    }

    #[tokio::test]
    async fn test_observer_gone_is_not_a_fault() {
        let (recorder, _rx) = recorder();
        let observer = weak(&recorder);
        drop(recorder);

        let (ours, mut peer) = connected_pair().await;
        let _socket = ConnectedSocket::spawn(ours, KEY, observer, &settings()).unwrap();
        peer.write_all(b"anyone?").await.unwrap();

        // Read task stops on the first undeliverable event, which closes
        // our end; the peer sees EOF.
        let mut buf = Vec::new();
        let read = tokio::time::timeout(WAIT, peer.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "Peer should observe the close");
    }
}
