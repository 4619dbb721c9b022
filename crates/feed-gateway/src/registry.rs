//! Connection Registry for tracking live feed connections

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::FeedConnection;

/// Live membership set of open realtime connections
///
/// Cheap to clone; clones share the same set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// All active connections: connection_id -> connection
    connections: Arc<DashMap<String, FeedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` if it was already registered.
    pub fn register(&self, connection: FeedConnection) -> bool {
        match self.connections.entry(connection.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                info!(
                    connection_id = %connection.id,
                    remote_addr = ?connection.metadata.remote_addr,
                    subject = ?connection.metadata.subject,
                    "Connection registered"
                );
                slot.insert(connection);
                true
            }
        }
    }

    /// Remove a connection and close its stream.
    ///
    /// Returns `false` if the connection was not registered.
    pub fn deregister(&self, connection_id: &str) -> bool {
        match self.connections.remove(connection_id) {
            Some((_, connection)) => {
                connection.close();
                info!(connection_id, "Connection deregistered");
                true
            }
            None => false,
        }
    }

    /// Current members, detached from the registry so callers can iterate
    /// while connections come and go
    pub fn snapshot(&self) -> Vec<FeedConnection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Ids of the current members
    pub fn list_connections(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Deregister and close every connection
    pub fn close_all(&self) -> usize {
        let closed = self
            .list_connections()
            .iter()
            .filter(|id| self.deregister(id))
            .count();
        info!(closed, "All connections closed");
        closed
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Get total connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Clean up connections whose socket side has gone away
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead_ids: Vec<String> = self
            .connections
            .iter()
            .filter(|e| !e.value().is_active())
            .map(|e| e.key().clone())
            .collect();

        let removed = dead_ids.iter().filter(|id| self.deregister(id)).count();
        if removed > 0 {
            debug!(removed, "Dead connections cleaned up");
        }
        removed
    }
}
