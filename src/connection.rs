use crate::{
    entity::UserInfo,
    registry::{ConnectionHandle, ConnectionRegistry, Frame},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Registry membership of one live connection.
///
/// The connection is `Open` only while registered. Closing unregisters it
/// exactly once; dropping an open connection closes it.
pub struct LiveConnection {
    user: UserInfo,
    handle: ConnectionHandle,
    registry: Arc<ConnectionRegistry>,
    state: ConnectionState,
}

impl LiveConnection {
    /// Register a new connection for `user` and hand back its outbound queue.
    pub fn open(
        registry: Arc<ConnectionRegistry>,
        user: UserInfo,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (handle, outbound) = ConnectionHandle::channel(queue_capacity);
        let mut conn = Self {
            user,
            handle,
            registry,
            state: ConnectionState::Connecting,
        };

        conn.registry.add(conn.user.id, conn.handle.clone());
        conn.state = ConnectionState::Open;
        info!(user = %conn.user, conn = %conn.handle.id(), "connection open");

        (conn, outbound)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Tear the connection down: signal its tasks, leave the registry.
    pub fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        self.handle.close();
        // Fan-out may already have removed a failed connection.
        self.registry.remove(self.user.id, self.handle.id());
        self.state = ConnectionState::Closed;
        info!(user = %self.user, conn = %self.handle.id(), "connection closed");
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}
