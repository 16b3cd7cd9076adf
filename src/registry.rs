//! Registry of live connections.
//!
//! Every accepted connection registers itself for the lifetime of its
//! handler. The registry only tracks membership; the sockets themselves stay
//! owned by their handlers. Shutdown works from a snapshot of the entries and
//! fires each connection's close signal outside the lock.

use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

/// One registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Unique for the process lifetime, unlike slab keys.
    pub id: u64,
    pub peer: SocketAddr,
    close: Arc<Notify>,
}

/// Registry of active connections using slab allocation.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<ConnectionEntry>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Slab<ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. It stays registered until the returned
    /// [`Registration`] is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let close = Arc::new(Notify::new());
        let key = self.lock().insert(ConnectionEntry {
            id,
            peer,
            close: Arc::clone(&close),
        });
        trace!(conn = id, peer = %peer, "Registered connection");

        Registration {
            registry: Arc::clone(self),
            key,
            id,
            peer,
            close,
        }
    }

    fn remove(&self, key: usize, id: u64) {
        let now_empty = {
            let mut connections = self.lock();
            if connections.get(key).is_some_and(|entry| entry.id == id) {
                connections.remove(key);
            }
            connections.is_empty()
        };
        trace!(conn = id, "Deregistered connection");

        if now_empty {
            self.drained.notify_waiters();
        }
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.lock().iter().map(|(_, entry)| entry.clone()).collect()
    }

    /// Signal every connection registered right now to close.
    ///
    /// Returns the number of connections signalled.
    pub fn close_all(&self) -> usize {
        let entries = self.snapshot();
        for entry in &entries {
            trace!(conn = entry.id, peer = %entry.peer, "Force-closing connection");
            entry.close.notify_one();
        }
        entries.len()
    }

    /// Whether a connection with this id is registered.
    #[cfg(test)]
    fn contains(&self, id: u64) -> bool {
        self.lock().iter().any(|(_, entry)| entry.id == id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until no connections remain, up to `limit`.
    ///
    /// Returns `true` if the registry drained in time.
    pub async fn wait_until_empty(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.is_ok()
    }
}

/// Membership of one connection; deregisters on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    key: usize,
    id: u64,
    peer: SocketAddr,
    close: Arc<Notify>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Completes once the registry asks this connection to close. A close
    /// request issued before this is awaited is not lost.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.key, self.id);
    }
}
