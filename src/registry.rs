//! Process-local registry of live connections, keyed by user.
//!
//! A user may hold several connections at once (devices, tabs). Every
//! operation takes the registry mutex for its whole duration, so readers only
//! ever see complete entries, and an entry exists iff it holds at least one
//! connection.

use crate::{
    entity::UserId,
    error::{ChatError, Result},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError},
    watch,
};
use tracing::debug;

/// A serialized frame, shared between every connection it is fanned out to.
pub type Frame = Arc<str>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cheap, cloneable handle to one live connection: its outbound queue plus a
/// close signal. Identity is the [`ConnectionId`], never the queue contents.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    closed: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        let handle = Self {
            id: ConnectionId::next(),
            tx,
            closed: Arc::new(closed),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame, waiting at most `timeout` for queue space.
    pub async fn deliver(&self, frame: Frame, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::Delivery(format!("{} is closing", self.id)));
        }
        self.tx
            .send_timeout(frame, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    ChatError::Delivery(format!("{} did not accept frame within {:?}", self.id, timeout))
                }
                SendTimeoutError::Closed(_) => {
                    ChatError::Delivery(format!("{} outbound queue is closed", self.id))
                }
            })
    }

    /// Ask the connection to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<UserId, Vec<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `user`, creating the entry if needed.
    pub fn add(&self, user: UserId, conn: ConnectionHandle) {
        let mut entries = self.entries.lock();
        let bucket = entries.entry(user).or_default();
        if bucket.iter().any(|c| c.id == conn.id) {
            return;
        }
        debug!(%user, conn = %conn.id, devices = bucket.len() + 1, "connection registered");
        bucket.push(conn);
    }

    /// Remove the connection with id `conn` from `user`'s entry.
    /// Returns whether anything was removed; unknown users or ids are a no-op.
    pub fn remove(&self, user: UserId, conn: ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        let Some(bucket) = entries.get_mut(&user) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|c| c.id == conn) else {
            return false;
        };
        bucket.swap_remove(index);
        if bucket.is_empty() {
            entries.remove(&user);
        }
        debug!(%user, %conn, "connection unregistered");
        true
    }

    /// Snapshot of `user`'s live connections at call time.
    pub fn lookup(&self, user: UserId) -> Vec<ConnectionHandle> {
        self.entries
            .lock()
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.lock().contains_key(&user)
    }

    pub fn user_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    /// Drop every entry and signal each connection to close.
    /// Returns the number of connections that were signalled.
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConnectionHandle> = {
            let mut entries = self.entries.lock();
            entries.drain().flat_map(|(_, bucket)| bucket).collect()
        };
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::channel(4).0
    }

    fn ids(conns: &[ConnectionHandle]) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = conns.iter().map(ConnectionHandle::id).collect();
        ids.sort();
        ids
    }

    #[test]
    fn add_lookup_remove_lifecycle() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let c1 = handle();
        let c2 = handle();

        registry.add(user, c1.clone());
        registry.add(user, c2.clone());
        assert_eq!(ids(&registry.lookup(user)), ids(&[c1.clone(), c2.clone()]));

        assert!(registry.remove(user, c1.id()));
        assert_eq!(ids(&registry.lookup(user)), vec![c2.id()]);
        assert!(registry.contains(user));

        assert!(registry.remove(user, c2.id()));
        assert!(registry.lookup(user).is_empty());
        assert!(!registry.contains(user));
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn remove_of_unknown_user_or_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let c1 = handle();

        assert!(!registry.remove(user, c1.id()));

        registry.add(user, c1.clone());
        assert!(!registry.remove(user, handle().id()));
        assert!(!registry.remove(UserId::new(), c1.id()));
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.remove(user, c1.id()));
        assert!(!registry.remove(user, c1.id()));
    }

    #[test]
    fn removing_one_device_keeps_the_other() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let first = handle();
        let second = handle();
        registry.add(user, first.clone());
        registry.add(user, second.clone());

        registry.remove(user, second.id());
        assert_eq!(ids(&registry.lookup(user)), vec![first.id()]);
    }

    #[test]
    fn adding_the_same_handle_twice_does_not_duplicate() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let c1 = handle();
        registry.add(user, c1.clone());
        registry.add(user, c1.clone());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn close_all_empties_registry_and_signals_connections() {
        let registry = ConnectionRegistry::new();
        let a = handle();
        let b = handle();
        registry.add(UserId::new(), a.clone());
        registry.add(UserId::new(), b.clone());

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.user_count(), 0);
        assert!(a.is_closed() && b.is_closed());
    }

    #[tokio::test]
    async fn deliver_fails_once_receiver_is_gone() {
        let (conn, rx) = ConnectionHandle::channel(1);
        drop(rx);
        let err = conn
            .deliver(Arc::from("x"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Delivery(_)));
    }

    #[tokio::test]
    async fn deliver_times_out_on_full_queue() {
        let (conn, _rx) = ConnectionHandle::channel(1);
        conn.deliver(Arc::from("first"), Duration::from_millis(10))
            .await
            .unwrap();
        let err = conn
            .deliver(Arc::from("second"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Delivery(_)));
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let conn = handle();
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(conn
            .deliver(Arc::from("late"), Duration::from_millis(10))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_and_removes_stay_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let user = UserId::new();
        let keeper = handle();
        registry.add(user, keeper.clone());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let conn = handle();
                for _ in 0..50 {
                    registry.add(user, conn.clone());
                    tokio::task::yield_now().await;
                    assert!(registry.lookup(user).iter().any(|c| c.id() == conn.id()));
                    assert!(registry.remove(user, conn.id()));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ids(&registry.lookup(user)), vec![keeper.id()]);
        assert_eq!(registry.connection_count(), 1);
    }
}
