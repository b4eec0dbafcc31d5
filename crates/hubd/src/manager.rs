use crate::connection::Connection;
use crate::error::HubError;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::RwLock;

/// Callback fired when a connection joins or leaves the manager.
pub type ConnHook = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Lifecycle hooks, fired outside any map guard.
#[derive(Default)]
pub struct Hooks {
    /// Fired after a connection is registered.
    pub on_add: Option<ConnHook>,
    /// Fired after a connection is deregistered, before it is closed.
    pub on_remove: Option<ConnHook>,
}

/// Registry of live connections with node-id and device-id secondary
/// indexes.
#[derive(Default)]
pub struct ConnectionManager {
    conns: DashMap<String, Arc<Connection>>,
    node_index: DashMap<u32, String>,
    device_index: DashMap<String, String>,
    hooks: RwLock<Hooks>,
}

impl ConnectionManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs lifecycle hooks. Call before the accept loop starts.
    pub fn set_hooks(&self, hooks: Hooks) {
        *self.hooks.write().expect("hooks lock poisoned") = hooks;
    }

    /// Registers a connection and fires `on_add`.
    ///
    /// # Errors
    ///
    /// [`HubError::ConnExists`] if the id is already registered.
    pub fn add(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        match self.conns.entry(conn.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(HubError::ConnExists(conn.id().to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&conn));
            }
        }
        if let Some(hook) = &self.hooks.read().expect("hooks lock poisoned").on_add {
            hook(&conn);
        }
        Ok(())
    }

    /// Deregisters a connection, purges its index entries, fires
    /// `on_remove`, and closes it.
    ///
    /// # Errors
    ///
    /// [`HubError::ConnNotFound`] if the id is unknown.
    pub fn remove(&self, id: &str) -> Result<(), HubError> {
        let Some((_, conn)) = self.conns.remove(id) else {
            return Err(HubError::ConnNotFound(id.to_string()));
        };
        self.node_index.retain(|_, v| v != id);
        self.device_index.retain(|_, v| v != id);
        if let Some(hook) = &self.hooks.read().expect("hooks lock poisoned").on_remove {
            hook(&conn);
        }
        conn.close();
        Ok(())
    }

    /// Looks up a connection by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Looks up the connection bound to a node id.
    #[must_use]
    pub fn get_by_node(&self, node_id: u32) -> Option<Arc<Connection>> {
        let id = self.node_index.get(&node_id)?.value().clone();
        self.get(&id)
    }

    /// Looks up the connection bound to a device id.
    #[must_use]
    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<Connection>> {
        let id = self.device_index.get(device_id)?.value().clone();
        self.get(&id)
    }

    /// Points the node index at a connection, or clears the entry.
    pub fn update_node_index(&self, node_id: u32, conn: Option<&Arc<Connection>>) {
        match conn {
            Some(c) => {
                self.node_index.insert(node_id, c.id().to_string());
            }
            None => {
                self.node_index.remove(&node_id);
            }
        }
    }

    /// Points the device index at a connection, or clears the entry.
    pub fn update_device_index(&self, device_id: &str, conn: Option<&Arc<Connection>>) {
        match conn {
            Some(c) => {
                self.device_index
                    .insert(device_id.to_string(), c.id().to_string());
            }
            None => {
                self.device_index.remove(device_id);
            }
        }
    }

    /// Iterates a snapshot of the registry; `f` may close connections.
    /// Returning `false` stops the iteration.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>) -> bool,
    {
        let snapshot: Vec<Arc<Connection>> =
            self.conns.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in &snapshot {
            if !f(conn) {
                return;
            }
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Sends raw bytes to every connection except `except`. Per-connection
    /// failures are logged and skipped.
    pub fn broadcast(&self, data: &[u8], except: Option<&str>) {
        self.range(|conn| {
            if except.is_some_and(|id| id == conn.id()) {
                return true;
            }
            if let Err(e) = conn.send(data.to_vec()) {
                tracing::warn!(conn = %conn.id(), "broadcast send failed: {}", e);
            }
            true
        });
    }

    /// Drains the registry, firing `on_remove` and closing every connection.
    pub fn close_all(&self) {
        let snapshot: Vec<Arc<Connection>> =
            self.conns.iter().map(|e| Arc::clone(e.value())).collect();
        self.conns.clear();
        self.node_index.clear();
        self.device_index.clear();
        for conn in snapshot {
            if let Some(hook) = &self.hooks.read().expect("hooks lock poisoned").on_remove {
                hook(&conn);
            }
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    async fn test_conn() -> Arc<Connection> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        Connection::spawn(
            client,
            addr,
            false,
            8,
            std::time::Duration::from_secs(5),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn add_and_get() {
        let cm = ConnectionManager::new();
        let conn = test_conn().await;
        cm.add(Arc::clone(&conn)).unwrap();
        assert_eq!(cm.count(), 1);
        assert!(cm.get(conn.id()).is_some());
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let cm = ConnectionManager::new();
        let conn = test_conn().await;
        cm.add(Arc::clone(&conn)).unwrap();
        assert!(matches!(cm.add(conn), Err(HubError::ConnExists(_))));
    }

    #[tokio::test]
    async fn remove_purges_indexes_and_closes() {
        let cm = ConnectionManager::new();
        let conn = test_conn().await;
        cm.add(Arc::clone(&conn)).unwrap();
        cm.update_node_index(9, Some(&conn));
        cm.update_device_index("dev-1", Some(&conn));
        assert!(cm.get_by_node(9).is_some());
        assert!(cm.get_by_device("dev-1").is_some());

        cm.remove(conn.id()).unwrap();
        assert!(cm.get_by_node(9).is_none());
        assert!(cm.get_by_device("dev-1").is_none());
        assert!(conn.is_closed());
        assert!(matches!(
            cm.remove(conn.id()),
            Err(HubError::ConnNotFound(_))
        ));
    }

    #[tokio::test]
    async fn hooks_fire_on_add_and_remove() {
        let cm = ConnectionManager::new();
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let (a, r) = (Arc::clone(&added), Arc::clone(&removed));
        cm.set_hooks(Hooks {
            on_add: Some(Box::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })),
            on_remove: Some(Box::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })),
        });

        let conn = test_conn().await;
        cm.add(Arc::clone(&conn)).unwrap();
        cm.remove(conn.id()).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn range_snapshot_allows_closing() {
        let cm = ConnectionManager::new();
        let c1 = test_conn().await;
        let c2 = test_conn().await;
        cm.add(Arc::clone(&c1)).unwrap();
        cm.add(Arc::clone(&c2)).unwrap();

        let mut seen = 0;
        cm.range(|conn| {
            seen += 1;
            let _ = cm.remove(&conn.id().to_string());
            true
        });
        assert_eq!(seen, 2);
        assert_eq!(cm.count(), 0);
    }

    #[tokio::test]
    async fn close_all_drains() {
        let cm = ConnectionManager::new();
        let c1 = test_conn().await;
        let c2 = test_conn().await;
        cm.add(Arc::clone(&c1)).unwrap();
        cm.add(Arc::clone(&c2)).unwrap();
        cm.close_all();
        assert_eq!(cm.count(), 0);
        assert!(c1.is_closed());
        assert!(c2.is_closed());
    }

    #[tokio::test]
    async fn update_node_index_clears_entry() {
        let cm = ConnectionManager::new();
        let conn = test_conn().await;
        cm.add(Arc::clone(&conn)).unwrap();
        cm.update_node_index(3, Some(&conn));
        cm.update_node_index(3, None);
        assert!(cm.get_by_node(3).is_none());
    }
}
