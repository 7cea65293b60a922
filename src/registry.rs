use crate::conn::Connection;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Owns every live [`Connection`], keyed by socket descriptor.
///
/// The registry holds the strong references; reactor closures keep only
/// weak ones, so dropping an entry here is what ends a connection's life.
/// The map lock is never held across `Connection::close` — entries are
/// detached first — so close callbacks may safely re-enter the registry.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<RawFd, Arc<Connection>>>,
    total_created: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            total_created: AtomicU64::new(0),
        }
    }

    /// Inserts the connection and starts it. Rejects a descriptor that is
    /// already tracked; a failed start removes the entry again and closes
    /// the connection.
    pub fn start(&self, conn: Arc<Connection>) -> Result<()> {
        let fd = conn.fd();
        {
            let mut connections = self.connections.lock().unwrap();
            if connections.contains_key(&fd) {
                return Err(Error::DuplicateConnection(fd));
            }
            connections.insert(fd, conn.clone());
        }

        if let Err(e) = conn.start() {
            self.connections.lock().unwrap().remove(&fd);
            conn.close();
            return Err(e);
        }

        self.total_created.fetch_add(1, Ordering::Relaxed);
        debug!("connection fd {fd} registered ({} active)", self.count());
        Ok(())
    }

    /// Closes and removes the connection for `fd`. Returns false when the
    /// descriptor is unknown.
    pub fn stop(&self, fd: RawFd) -> bool {
        let conn = self.connections.lock().unwrap().remove(&fd);
        match conn {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Closes everything. Entries are drained under the lock and closed
    /// outside it.
    pub fn stop_all(&self) {
        let drained: Vec<_> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close();
        }
    }

    /// Removes an entry without closing it; used by the close-callback a
    /// connection fires while it is already tearing itself down.
    pub fn detach(&self, fd: RawFd) {
        self.connections.lock().unwrap().remove(&fd);
    }

    pub fn exists(&self, fd: RawFd) -> bool {
        self.connections.lock().unwrap().contains_key(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&fd).cloned()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }
}
