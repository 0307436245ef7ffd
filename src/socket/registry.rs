//! Id → entry bookkeeping.
//!
//! Not synchronized on its own: the manager keeps it behind one mutex and
//! does every read-modify-write under that lock.

use std::collections::HashMap;

use super::error::SocketError;
use super::transport::{ConnectedSocket, ListeningSocket, SocketKey};
use super::{ConnectionId, SocketAddress};

/// Live socket registered under an id.
#[derive(Debug)]
pub(crate) enum Entry {
    Listening(ListeningSocket),
    Connected(ConnectedSocket),
}

impl Entry {
    /// Address reported in this entry's `Connect`/`Connection` event.
    pub(crate) fn address(&self) -> &SocketAddress {
        match self {
            Self::Listening(listener) => listener.local_address(),
            Self::Connected(socket) => socket.peer_address(),
        }
    }

    /// Asks the adapter to close. Its `Closed` event arrives later.
    pub(crate) fn close(&self) {
        match self {
            Self::Listening(listener) => listener.stop(),
            Self::Connected(socket) => socket.end(),
        }
    }

    /// Closes an entry that is no longer registered.
    ///
    /// Connections still flush queued writes; nothing is reported back for
    /// them since their key is gone.
    pub(crate) fn close_detached(self) {
        match self {
            Self::Listening(listener) => listener.stop(),
            Self::Connected(socket) => socket.end_detached(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Listening(_) => "listening",
            Self::Connected(_) => "connected",
        }
    }
}

#[derive(Debug)]
struct Registered {
    serial: u64,
    entry: Entry,
}

/// Registry of live entries and in-flight reservations.
#[derive(Debug)]
pub(crate) struct Registry {
    entries: HashMap<ConnectionId, Registered>,
    /// Ids reserved by `listen`/`connect` that haven't completed yet.
    pending: HashMap<ConnectionId, u64>,
    /// Next accept-id candidate. `None` once the id range is used up.
    next_accept_id: Option<ConnectionId>,
    next_serial: u64,
}

impl Registry {
    pub(crate) fn new(accept_id_seed: ConnectionId) -> Self {
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
            next_accept_id: Some(accept_id_seed),
            next_serial: 0,
        }
    }

    fn in_use(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id) || self.pending.contains_key(&id)
    }

    fn next_key(&mut self, id: ConnectionId) -> SocketKey {
        self.next_serial += 1;
        SocketKey {
            id,
            serial: self.next_serial,
        }
    }

    /// Reserves a controller-supplied id for an in-flight listen/connect.
    pub(crate) fn reserve(&mut self, id: ConnectionId) -> Result<SocketKey, SocketError> {
        if self.in_use(id) {
            return Err(SocketError::DuplicateId(id));
        }
        let key = self.next_key(id);
        self.pending.insert(id, key.serial);
        Ok(key)
    }

    /// Returns `true` if `key` is still an outstanding reservation.
    pub(crate) fn is_pending(&self, key: SocketKey) -> bool {
        self.pending.get(&key.id) == Some(&key.serial)
    }

    /// Drops a reservation. Returns `false` if it was already gone.
    pub(crate) fn release(&mut self, key: SocketKey) -> bool {
        if self.is_pending(key) {
            self.pending.remove(&key.id);
            true
        } else {
            false
        }
    }

    /// Turns a reservation into a live entry.
    ///
    /// Hands the entry back if the reservation is gone (shutdown ran in
    /// the meantime).
    pub(crate) fn commit(&mut self, key: SocketKey, entry: Entry) -> Result<(), Entry> {
        if !self.release(key) {
            return Err(entry);
        }
        self.insert(key, entry);
        Ok(())
    }

    /// Allocates the key for a server-accepted connection.
    ///
    /// Ids come from a monotonic counter that skips anything pending or
    /// registered. The counter never wraps.
    pub(crate) fn allocate_accept_key(&mut self) -> Result<SocketKey, SocketError> {
        loop {
            let candidate = self.next_accept_id.ok_or(SocketError::AcceptIdsExhausted)?;
            self.next_accept_id = candidate.checked_add(1);
            if !self.in_use(candidate) {
                return Ok(self.next_key(candidate));
            }
        }
    }

    /// Registers an entry under a freshly allocated accept key.
    pub(crate) fn insert_accepted(&mut self, key: SocketKey, entry: Entry) {
        self.insert(key, entry);
    }

    fn insert(&mut self, key: SocketKey, entry: Entry) {
        let previous = self.entries.insert(
            key.id,
            Registered {
                serial: key.serial,
                entry,
            },
        );
        debug_assert!(
            previous.is_none(),
            "connection id {} registered twice",
            key.id
        );
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<&Entry> {
        self.entries.get(&id).map(|r| &r.entry)
    }

    /// Entry for `key`, only if that exact registration is still live.
    pub(crate) fn get_current(&self, key: SocketKey) -> Option<&Entry> {
        self.entries
            .get(&key.id)
            .filter(|r| r.serial == key.serial)
            .map(|r| &r.entry)
    }

    /// Removes the entry for `key`, only if that exact registration is
    /// still live.
    pub(crate) fn remove_current(&mut self, key: SocketKey) -> Option<Entry> {
        if self.get_current(key).is_none() {
            return None;
        }
        let removed = self.entries.remove(&key.id).map(|r| r.entry);
        if let Some(entry) = &removed {
            log::trace!("[SocketManager] Removed {} entry {}", entry.kind(), key.id);
        }
        removed
    }

    /// Empties the registry, including pending reservations.
    pub(crate) fn drain(&mut self) -> Vec<(ConnectionId, Entry)> {
        self.pending.clear();
        let mut drained: Vec<_> = self
            .entries
            .drain()
            .map(|(id, registered)| (id, registered.entry))
            .collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Weak};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::task::TaskTracker;

    use crate::socket::transport::{ConnectionSettings, TransportEvent, TransportObserver};

    struct Ignore;

    impl TransportObserver for Ignore {
        fn on_transport_event(&self, _key: SocketKey, _event: TransportEvent) {}
    }

    /// Builds a real listening entry on an ephemeral loopback port.
    async fn listening_entry(key: SocketKey, observer: &Arc<Ignore>) -> Entry {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let observer: Arc<dyn TransportObserver> = observer.clone();
        let weak: Weak<dyn TransportObserver> = Arc::downgrade(&observer);
        Entry::Listening(ListeningSocket::spawn(listener, key, weak, &TaskTracker::new()).unwrap())
    }

    #[test]
    fn test_reserve_rejects_duplicates() {
        let mut registry = Registry::new(5000);
        let key = registry.reserve(1).unwrap();
        assert!(registry.is_pending(key));
        assert!(matches!(
            registry.reserve(1),
            Err(SocketError::DuplicateId(1))
        ));

        assert!(registry.release(key));
        assert!(!registry.release(key));
        assert!(registry.reserve(1).is_ok());
    }

    #[test]
    fn test_reused_id_gets_new_serial() {
        let mut registry = Registry::new(5000);
        let first = registry.reserve(3).unwrap();
        registry.release(first);
        let second = registry.reserve(3).unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.serial, second.serial);
        assert!(!registry.is_pending(first));
    }

    #[test]
    fn test_accept_ids_start_at_seed_and_increase() {
        let mut registry = Registry::new(5000);
        let ids: Vec<_> = (0..3)
            .map(|_| registry.allocate_accept_key().unwrap().id)
            .collect();
        assert_eq!(ids, vec![5000, 5001, 5002]);
    }

    #[test]
    fn test_accept_ids_skip_reserved_controller_ids() {
        let mut registry = Registry::new(5000);
        registry.reserve(5000).unwrap();
        registry.reserve(5001).unwrap();

        assert_eq!(registry.allocate_accept_key().unwrap().id, 5002);
    }

    #[test]
    fn test_accept_ids_do_not_wrap() {
        let mut registry = Registry::new(u32::MAX - 1);
        assert_eq!(registry.allocate_accept_key().unwrap().id, u32::MAX - 1);
        assert_eq!(registry.allocate_accept_key().unwrap().id, u32::MAX);
        assert!(matches!(
            registry.allocate_accept_key(),
            Err(SocketError::AcceptIdsExhausted)
        ));
    }

    #[tokio::test]
    async fn test_commit_after_drain_hands_entry_back() {
        let observer = Arc::new(Ignore);
        let mut registry = Registry::new(5000);
        let key = registry.reserve(1).unwrap();

        assert!(registry.drain().is_empty());
        let entry = listening_entry(key, &observer).await;
        assert!(registry.commit(key, entry).is_err());
        assert!(!registry.contains(1));
    }

    #[tokio::test]
    async fn test_stale_key_cannot_remove_new_registration() {
        let observer = Arc::new(Ignore);
        let mut registry = Registry::new(5000);

        let old = registry.reserve(1).unwrap();
        let entry = listening_entry(old, &observer).await;
        registry.commit(old, entry).unwrap();
        assert!(registry.remove_current(old).is_some());

        let new = registry.reserve(1).unwrap();
        let entry = listening_entry(new, &observer).await;
        registry.commit(new, entry).unwrap();

        assert!(registry.remove_current(old).is_none());
        assert!(registry.get_current(new).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_empties_entries_and_reservations() {
        let observer = Arc::new(Ignore);
        let mut registry = Registry::new(5000);

        for id in [2, 1] {
            let key = registry.reserve(id).unwrap();
            let entry = listening_entry(key, &observer).await;
            registry.commit(key, entry).unwrap();
        }
        let pending = registry.reserve(3).unwrap();

        let drained: Vec<_> = registry.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(registry.len(), 0);
        assert!(!registry.is_pending(pending));
    }

    #[tokio::test]
    async fn test_accepted_entry_is_connected_kind() {
        let observer = Arc::new(Ignore);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let mut registry = Registry::new(5000);
        let key = registry.allocate_accept_key().unwrap();
        let observer: Arc<dyn TransportObserver> = observer;
        let settings = ConnectionSettings {
            read_buffer_size: 1024,
            linger: std::time::Duration::from_secs(1),
            tasks: TaskTracker::new(),
        };
        let socket =
            ConnectedSocket::spawn(stream.unwrap(), key, Arc::downgrade(&observer), &settings)
                .unwrap();
        registry.insert_accepted(key, Entry::Connected(socket));

        let entry = registry.get(5000).unwrap();
        assert_eq!(entry.kind(), "connected");
        assert_eq!(entry.address().port, addr.port());
    }
}
