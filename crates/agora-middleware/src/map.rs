//! Replicated key-value maps.
//!
//! The kernel treats the cluster-shared maps as an abstract
//! [`DistributedMap`]: any replicated store that offers insert-if-absent and
//! pure removal can back it.  [`InMemoryMap`] is the single-process
//! implementation used by [`InMemoryCluster`][crate::cluster::InMemoryCluster].
//!
//! # Map identities
//!
//! | Name | Content |
//! |---|---|
//! | `"<clusterId>"` | context id → default-space id |
//! | `"<clusterId>-kernels"` | membership address → public kernel endpoint |

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use agora_types::{ContextId, KernelUri, MemberAddress};
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

/// Handle returned by [`DistributedMap::add_entry_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer of entry mutations on a [`DistributedMap`].
///
/// Every callback has an empty default body so observers only implement the
/// transitions they care about.
pub trait EntryListener<K, V>: Send + Sync {
    fn entry_added(&self, _key: &K, _value: &V) {}
    fn entry_removed(&self, _key: &K, _value: &V) {}
    fn entry_updated(&self, _key: &K, _value: &V) {}
}

/// A cluster-shared map.
///
/// Concurrent writers on different kernels are expected to use only
/// [`put_if_absent`][Self::put_if_absent] and [`remove`][Self::remove] for
/// values that carry identity; [`put`][Self::put] exists for completeness.
pub trait DistributedMap<K, V>: Send + Sync {
    /// Name of the map inside the cluster.
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Blind write.  Returns the previous value.
    fn put(&self, key: K, value: V) -> Option<V>;

    /// Insert only when `key` is absent.  Returns the value already stored,
    /// or `None` when this call inserted `value`.
    fn put_if_absent(&self, key: K, value: V) -> Option<V>;

    /// Remove `key`.  Returns the removed value, `None` when absent.
    fn remove(&self, key: &K) -> Option<V>;

    /// Point-in-time snapshot of every entry.
    fn entries(&self) -> Vec<(K, V)>;

    /// Point-in-time snapshot of every value.
    fn values(&self) -> Vec<V> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    fn add_entry_listener(&self, listener: Arc<dyn EntryListener<K, V>>) -> ListenerId;

    /// Returns `false` when `id` was not registered.
    fn remove_entry_listener(&self, id: ListenerId) -> bool;
}

/// Factory for the two maps the kernel needs.
pub trait DistributedDataProvider: Send + Sync {
    /// The directory map, named `"<clusterId>"`.
    fn context_map(&self, cluster_id: &str) -> Arc<dyn DistributedMap<ContextId, Uuid>>;

    /// The peer registry, named `"<clusterId>-kernels"`.
    fn kernel_map(&self, cluster_id: &str) -> Arc<dyn DistributedMap<MemberAddress, KernelUri>>;
}

/// Name of the directory map for `cluster_id`.
pub fn context_map_name(cluster_id: &str) -> String {
    cluster_id.to_string()
}

/// Name of the peer registry map for `cluster_id`.
pub fn kernel_map_name(cluster_id: &str) -> String {
    format!("{cluster_id}-kernels")
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

type Listeners<K, V> = Vec<(ListenerId, Arc<dyn EntryListener<K, V>>)>;

struct MapState<K, V> {
    entries: HashMap<K, V>,
    listeners: Listeners<K, V>,
    next_listener: u64,
}

enum Mutation<V> {
    Added(V),
    Updated(V),
    Removed(V),
}

/// Process-local [`DistributedMap`].
///
/// Listeners are snapshotted while the lock is held and called after it is
/// released, so a listener may call back into the map.
pub struct InMemoryMap<K, V> {
    name: String,
    state: Mutex<MapState<K, V>>,
}

impl<K, V> InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MapState {
                entries: HashMap::new(),
                listeners: Vec::new(),
                next_listener: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `op` under the lock and fan the resulting mutation out to a
    /// snapshot of the listeners.
    fn mutate<R>(
        &self,
        key: &K,
        op: impl FnOnce(&mut HashMap<K, V>) -> (R, Option<Mutation<V>>),
    ) -> R {
        let (result, mutation, listeners) = {
            let mut state = self.state.lock();
            let (result, mutation) = op(&mut state.entries);
            let listeners: Vec<_> = match mutation {
                Some(_) => state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
                None => Vec::new(),
            };
            (result, mutation, listeners)
        };
        if let Some(mutation) = mutation {
            trace!(map = %self.name, listeners = listeners.len(), "dispatching entry event");
            for listener in listeners {
                match &mutation {
                    Mutation::Added(v) => listener.entry_added(key, v),
                    Mutation::Updated(v) => listener.entry_updated(key, v),
                    Mutation::Removed(v) => listener.entry_removed(key, v),
                }
            }
        }
        result
    }
}

impl<K, V> DistributedMap<K, V> for InMemoryMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.state.lock().entries.get(key).cloned()
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        let k = key.clone();
        self.mutate(&k, move |entries| {
            let previous = entries.insert(key, value.clone());
            let mutation = if previous.is_some() {
                Mutation::Updated(value)
            } else {
                Mutation::Added(value)
            };
            (previous, Some(mutation))
        })
    }

    fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let k = key.clone();
        self.mutate(&k, move |entries| {
            if let Some(existing) = entries.get(&key) {
                return (Some(existing.clone()), None);
            }
            entries.insert(key, value.clone());
            (None, Some(Mutation::Added(value)))
        })
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.mutate(key, |entries| match entries.remove(key) {
            Some(v) => (Some(v.clone()), Some(Mutation::Removed(v))),
            None => (None, None),
        })
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn add_entry_listener(&self, listener: Arc<dyn EntryListener<K, V>>) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, listener));
        id
    }

    fn remove_entry_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EntryListener<String, u32> for Recorder {
        fn entry_added(&self, key: &String, value: &u32) {
            self.events.lock().push(format!("added {key}={value}"));
        }
        fn entry_removed(&self, key: &String, value: &u32) {
            self.events.lock().push(format!("removed {key}={value}"));
        }
        fn entry_updated(&self, key: &String, value: &u32) {
            self.events.lock().push(format!("updated {key}={value}"));
        }
    }

    #[test]
    fn put_if_absent_keeps_first_writer() {
        let map: InMemoryMap<String, u32> = InMemoryMap::new("test");
        assert_eq!(map.put_if_absent("a".into(), 1), None);
        assert_eq!(map.put_if_absent("a".into(), 2), Some(1));
        assert_eq!(map.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn listeners_see_only_real_mutations() {
        let map: InMemoryMap<String, u32> = InMemoryMap::new("test");
        let recorder = Arc::new(Recorder::default());
        map.add_entry_listener(recorder.clone());

        map.put_if_absent("a".into(), 1);
        map.put_if_absent("a".into(), 9);
        map.put("a".into(), 2);
        map.remove(&"a".to_string());
        map.remove(&"a".to_string());

        assert_eq!(
            *recorder.events.lock(),
            vec!["added a=1", "updated a=2", "removed a=2"]
        );
    }

    #[test]
    fn removed_listener_is_not_called() {
        let map: InMemoryMap<String, u32> = InMemoryMap::new("test");
        let recorder = Arc::new(Recorder::default());
        let id = map.add_entry_listener(recorder.clone());
        assert!(map.remove_entry_listener(id));
        assert!(!map.remove_entry_listener(id));
        map.put("a".into(), 1);
        assert!(recorder.events.lock().is_empty());
    }

    struct Reentrant {
        map: Arc<InMemoryMap<String, u32>>,
    }

    impl EntryListener<String, u32> for Reentrant {
        fn entry_added(&self, key: &String, _value: &u32) {
            // Must not deadlock: the map lock is released before dispatch.
            self.map.remove(key);
        }
    }

    #[test]
    fn listener_may_reenter_map() {
        let map = Arc::new(InMemoryMap::<String, u32>::new("test"));
        map.add_entry_listener(Arc::new(Reentrant { map: map.clone() }));
        map.put("a".into(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn map_names_follow_cluster_id() {
        assert_eq!(context_map_name("agora"), "agora");
        assert_eq!(kernel_map_name("agora"), "agora-kernels");
    }
}
