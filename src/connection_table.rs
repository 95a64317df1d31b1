use std::fmt::{Display, Formatter};
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::trace;

/// Identity of a connection on the wire: the interconnect instance, the peer's address and the
///  logical channel inside the instance
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionKey {
    pub instance_id: u32,
    pub remote: SocketAddr,
    pub channel_id: u16,
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.instance_id, self.remote, self.channel_id)
    }
}

/// Process-unique id of a connection. Ids are never reused, so an id identifies one specific
///  connection even after its key was reused by a successor.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Entries in the table expose the id they were registered with
pub trait HasConnectionId {
    fn connection_id(&self) -> ConnectionId;
}

/// The set of live connections, keyed by [ConnectionKey].
///
/// This is a copy-on-write map: lookups clone an `Arc` of the current map under a short read
///  lock, and mutations replace the map. Lookups on the receive path are far more frequent than
///  connection setup and teardown, and they never wait for a mutation in progress.
pub struct ConnectionTable<V: Clone + HasConnectionId> {
    map: RwLock<Arc<FxHashMap<ConnectionKey, V>>>,
    id_counter: AtomicU64,
}

impl<V: Clone + HasConnectionId> Default for ConnectionTable<V> {
    fn default() -> Self {
        ConnectionTable {
            map: Default::default(),
            id_counter: AtomicU64::new(1),
        }
    }
}

impl<V: Clone + HasConnectionId> ConnectionTable<V> {
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.id_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn load(&self) -> Arc<FxHashMap<ConnectionKey, V>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<ConnectionKey, V>) -> R) -> R {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let mut new_map = map.as_ref().clone();
        let result = f(&mut new_map);
        *map = Arc::new(new_map);
        result
    }

    pub fn lookup(&self, key: &ConnectionKey) -> Option<V> {
        self.load().get(key).cloned()
    }

    pub fn insert(&self, key: ConnectionKey, value: V) -> anyhow::Result<()> {
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&key) {
            bail!("connection {} is already registered", key);
        }
        trace!("registering connection {} as {}", key, value.connection_id());
        let mut new_map = map.as_ref().clone();
        new_map.insert(key, value);
        *map = Arc::new(new_map);
        Ok(())
    }

    /// Return the live entry for `key`, registering the result of `f` if there is none. The
    ///  boolean is `true` if the entry was created by this call.
    pub fn get_or_insert_with(&self, key: ConnectionKey, f: impl FnOnce(ConnectionId) -> V) -> (V, bool) {
        if let Some(existing) = self.lookup(&key) {
            return (existing, false);
        }

        self.update(|map| {
            if let Some(existing) = map.get(&key) {
                return (existing.clone(), false);
            }
            let value = f(self.allocate_id());
            trace!("registering connection {} as {}", key, value.connection_id());
            map.insert(key, value.clone());
            (value, true)
        })
    }

    /// Remove the entry for `key` if and only if it is the connection with the given id, so that
    ///  a late teardown never removes a successor registered under the same key
    pub fn remove(&self, key: &ConnectionKey, id: ConnectionId) -> bool {
        if !self.load().get(key).map(|v| v.connection_id() == id).unwrap_or(false) {
            return false;
        }

        self.update(|map| {
            if map.get(key).map(|v| v.connection_id() == id).unwrap_or(false) {
                trace!("unregistering connection {} ({})", key, id);
                map.remove(key);
                true
            }
            else {
                false
            }
        })
    }

    /// all live connections at the time of the call
    pub fn snapshot(&self) -> Vec<V> {
        self.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }
}
