//! # Connection registry
//!
//! Owns every live connection, keyed by fd, behind one mutex with short
//! critical sections. The stored value is an `Arc`, so a lookup hands back a
//! reference that stays valid without the registry lock; the caller relies
//! on the dispatch discipline (one armed interest per fd, removal only
//! after the coroutine's final yield) to know nobody destroys the state
//! under it mid-resume.

use crate::stream::SocketStream;
use nisse_runtime::{Coroutine, Direction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

/// What a suspended connection coroutine asks its resumer to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskYieldState {
    /// Arm read interest and resume when readable.
    RestoreRead,
    /// Arm write interest and resume when writable.
    RestoreWrite,
    /// The connection is done; destroy it.
    Remove,
}

/// The single value transferred at each coroutine suspension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskYieldAction {
    pub state: TaskYieldState,
    pub fd: RawFd,
}

/// Where a connection currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Installed, coroutine not yet entered.
    Accepting,
    /// A worker is executing the coroutine.
    Running,
    /// Parked, waiting for readiness in the given direction.
    Suspended(Direction),
    /// Final yield seen; removal is queued.
    Closing,
}

/// Mutable half of a connection: the stream the engine reads and writes,
/// and the coroutine that runs the engine.
pub(crate) struct ConnState {
    pub stream: SocketStream,
    pub coroutine: Option<Coroutine<TaskYieldAction>>,
    pub phase: Phase,
}

/// One accepted connection. The registry holds it by `Arc`; the resume job
/// locks `state` for the duration of a single resume cycle.
pub struct Connection {
    fd: RawFd,
    pub(crate) state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn new(fd: RawFd, stream: SocketStream) -> Arc<Self> {
        Arc::new(Self {
            fd,
            state: Mutex::new(ConnState {
                stream,
                coroutine: None,
                phase: Phase::Accepting,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }
}

/// fd-keyed map of live connections.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Store a connection under its fd. Returns the shared handle.
    pub fn insert(&self, connection: Arc<Connection>) -> Arc<Connection> {
        self.connections
            .lock()
            .insert(connection.fd(), connection.clone());
        connection
    }

    /// Stable reference to a live connection, if present.
    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.lock().get(&fd).cloned()
    }

    /// Drop the registry's ownership of a connection. The state itself dies
    /// when the last outstanding `Arc` goes away.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.lock().remove(&fd)
    }

    /// Drop everything. Used at shutdown, after the reactor has stopped.
    pub fn clear(&self) {
        self.connections.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn test_connection() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (sock, _) = listener.accept().unwrap();
        let stream = SocketStream::plain(sock).unwrap();
        let fd = stream.fd();
        (Connection::new(fd, stream), client)
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let registry = ConnectionRegistry::new();
        let (conn, _client) = test_connection();
        let fd = conn.fd();

        registry.insert(conn);
        assert_eq!(registry.len(), 1);

        let found = registry.get(fd).expect("connection should be present");
        assert_eq!(found.fd(), fd);
        assert_eq!(found.phase(), Phase::Accepting);

        // The handle outlives removal; the entry does not.
        let removed = registry.remove(fd).unwrap();
        assert!(registry.get(fd).is_none());
        assert!(registry.is_empty());
        assert_eq!(removed.fd(), found.fd());
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        let (a, _ca) = test_connection();
        let (b, _cb) = test_connection();
        registry.insert(a);
        registry.insert(b);
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }
}
