use crate::connection::{Connection, ConnectionId};
use crate::error::{Error, ErrorKind, Result};
use log::*;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The connections currently attached to this hub, keyed by connection id.
///
/// Only the hub mutates the registry (attach and detach). Fan-out reads it under the
/// read lock through [`ConnectionRegistry::for_each_except`]; no other component holds
/// references into the map.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection. Ids are random v4 uuids, a collision is refused rather than
    /// silently replacing the live connection.
    pub fn add(&self, connection: Arc<Connection>) -> Result<()> {
        let mut connections = self.write();
        if connections.contains_key(connection.id()) {
            error!("Connection {} is already registered", connection.id());
            return Err(Error::new(ErrorKind::DuplicateId));
        }
        connections.insert(connection.id().clone(), connection);
        Ok(())
    }

    /// Unregister a connection. Returns the entry if it was still present.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.write().remove(connection_id)
    }

    /// Applies `f` to every registered connection other than `excluded_id`.
    ///
    /// Runs under the read lock: attach and detach wait at most for one pass, and a
    /// connection attaching mid-pass may or may not be visited.
    pub fn for_each_except<F>(&self, excluded_id: &str, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for (id, connection) in self.read().iter() {
            if id.as_str() != excluded_id {
                f(connection);
            }
        }
    }

    /// Removes and returns every registered connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.write().drain().map(|(_, connection)| connection).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
