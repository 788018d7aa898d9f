//! [`DirectoryService`] – the in-process registry of [`Context`]s, kept in
//! step with the replicated directory map (`context id → default space id`).
//!
//! The replicated map is the source of truth for which contexts exist in the
//! cluster.  Local contexts are a materialization of its entries:
//!
//! | Trigger | Local effect | Map effect |
//! |---|---|---|
//! | [`DirectoryService::create_context`] | materialize, fire `context_created` | put-if-absent |
//! | [`DirectoryService::remove_context`] | destroy, fire `context_destroyed` | remove |
//! | service start | materialize every existing entry | none |
//! | remote entry added | materialize if absent | none |
//! | remote entry removed | destroy if present | none |
//!
//! The map is only ever written with put-if-absent or remove.  Creation
//! inserts first and materializes second, so when two callers race to create
//! the same context the first insertion wins and both end up with the mirror
//! built on the winning default space id.
//!
//! Every path aligns the `contexts` table with the map entry as read under
//! the directory's own mutex, never with the value an entry event carried.
//! Listener notifications happen after that mutex is released, so listeners
//! (map entry listeners included) may call back into the directory.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use agora_middleware::{DistributedMap, EntryListener, ListenerId};
use agora_types::{AgoraError, ContextId, SpaceId};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::listeners::ListenerList;
use crate::service::{KernelService, Lifecycle, ServiceState};
use crate::space::{EventSpace, SpaceEnvironment};

// ────────────────────────────────────────────────────────────────────────────
// Listener contracts
// ────────────────────────────────────────────────────────────────────────────

pub trait ContextRepositoryListener: Send + Sync {
    fn context_created(&self, _context: &Arc<Context>) {}
    fn context_destroyed(&self, _context: &Arc<Context>) {}
}

pub trait SpaceRepositoryListener: Send + Sync {
    fn space_created(&self, _space: &Arc<EventSpace>) {}
    fn space_destroyed(&self, _space: &Arc<EventSpace>) {}
}

type SpaceListeners = Arc<ListenerList<dyn SpaceRepositoryListener>>;

// ────────────────────────────────────────────────────────────────────────────
// SpaceRepository
// ────────────────────────────────────────────────────────────────────────────

struct RepositoryState {
    spaces: HashMap<Uuid, Arc<EventSpace>>,
    destroyed: bool,
}

/// The spaces of one context.  The default space is created with the
/// repository and can only go away together with the whole context.
pub struct SpaceRepository {
    context_id: ContextId,
    default_space_id: Uuid,
    env: SpaceEnvironment,
    state: Mutex<RepositoryState>,
    listeners: SpaceListeners,
}

impl SpaceRepository {
    fn new(context_id: ContextId, default_space_id: Uuid, env: SpaceEnvironment, listeners: SpaceListeners) -> Self {
        let default = EventSpace::new(SpaceId::event_space(context_id, default_space_id), &env);
        Self {
            context_id,
            default_space_id,
            env,
            state: Mutex::new(RepositoryState {
                spaces: HashMap::from([(default_space_id, default)]),
                destroyed: false,
            }),
            listeners,
        }
    }

    /// Create a space.  Returns `Ok(None)` when `id` is already taken.
    pub fn create_space(&self, id: Uuid, spec: &str) -> Result<Option<Arc<EventSpace>>, AgoraError> {
        let space = {
            let mut state = self.state.lock();
            if state.destroyed || !state.spaces.contains_key(&self.default_space_id) {
                return Err(AgoraError::DefaultSpaceMissing(self.context_id));
            }
            if state.spaces.contains_key(&id) {
                return Ok(None);
            }
            let space = EventSpace::new(SpaceId::new(self.context_id, id, spec), &self.env);
            state.spaces.insert(id, Arc::clone(&space));
            space
        };
        debug!(space = %space.id(), spec, "space created");
        for listener in self.listeners.snapshot() {
            listener.space_created(&space);
        }
        Ok(Some(space))
    }

    /// Return the space `id`, creating it with `spec` if needed.
    pub fn get_or_create_space(&self, id: Uuid, spec: &str) -> Result<Arc<EventSpace>, AgoraError> {
        if let Some(space) = self.space(&id) {
            return Ok(space);
        }
        match self.create_space(id, spec)? {
            Some(space) => Ok(space),
            // Lost a creation race against another caller.
            None => self
                .space(&id)
                .ok_or_else(|| AgoraError::UnknownSpace(SpaceId::new(self.context_id, id, spec))),
        }
    }

    /// Destroy a non-default space.  Returns `Ok(false)` if it did not exist.
    pub fn destroy_space(&self, id: &Uuid) -> Result<bool, AgoraError> {
        if *id == self.default_space_id {
            return Err(AgoraError::DefaultSpaceProtected(SpaceId::event_space(
                self.context_id,
                *id,
            )));
        }
        let removed = self.state.lock().spaces.remove(id);
        match removed {
            Some(space) => {
                self.retire(&space);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn space(&self, id: &Uuid) -> Option<Arc<EventSpace>> {
        self.state.lock().spaces.get(id).cloned()
    }

    pub fn default_space(&self) -> Option<Arc<EventSpace>> {
        self.space(&self.default_space_id)
    }

    pub fn spaces(&self) -> Vec<Arc<EventSpace>> {
        self.state.lock().spaces.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every space, the default one last.
    fn destroy_all(&self) {
        let mut spaces: Vec<_> = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.spaces.drain().map(|(_, s)| s).collect()
        };
        spaces.sort_by_key(|s| s.id().id == self.default_space_id);
        for space in spaces {
            self.retire(&space);
        }
    }

    fn retire(&self, space: &Arc<EventSpace>) {
        space.clear();
        debug!(space = %space.id(), "space destroyed");
        for listener in self.listeners.snapshot() {
            listener.space_destroyed(space);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Context
// ────────────────────────────────────────────────────────────────────────────

/// A cluster-visible group of spaces with one default space.
pub struct Context {
    id: ContextId,
    default_space_id: Uuid,
    spaces: SpaceRepository,
}

impl Context {
    fn new(id: ContextId, default_space_id: Uuid, env: SpaceEnvironment, listeners: SpaceListeners) -> Arc<Self> {
        Arc::new(Self {
            id,
            default_space_id,
            spaces: SpaceRepository::new(id, default_space_id, env, listeners),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn default_space_id(&self) -> Uuid {
        self.default_space_id
    }

    /// The default space.  `None` only once the context has been destroyed.
    pub fn default_space(&self) -> Option<Arc<EventSpace>> {
        self.spaces.default_space()
    }

    pub fn spaces(&self) -> &SpaceRepository {
        &self.spaces
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("default_space_id", &self.default_space_id)
            .field("spaces", &self.spaces.len())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DirectoryService
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of aligning the local table with the map entry for one id.
struct Reconciled {
    current: Option<Arc<Context>>,
    created: bool,
    retired: Option<Arc<Context>>,
}

pub struct DirectoryService {
    this: Weak<DirectoryService>,
    map: Arc<dyn DistributedMap<ContextId, Uuid>>,
    env: SpaceEnvironment,
    contexts: Mutex<HashMap<ContextId, Arc<Context>>>,
    map_listener: Mutex<Option<ListenerId>>,
    lifecycle: Lifecycle,
    context_listeners: ListenerList<dyn ContextRepositoryListener>,
    space_listeners: SpaceListeners,
}

impl DirectoryService {
    pub fn new(map: Arc<dyn DistributedMap<ContextId, Uuid>>, env: SpaceEnvironment) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            map,
            env,
            contexts: Mutex::new(HashMap::new()),
            map_listener: Mutex::new(None),
            lifecycle: Lifecycle::default(),
            context_listeners: ListenerList::default(),
            space_listeners: Arc::default(),
        })
    }

    pub fn add_context_listener(&self, listener: Arc<dyn ContextRepositoryListener>) {
        self.context_listeners.add(listener);
    }

    pub fn add_space_listener(&self, listener: Arc<dyn SpaceRepositoryListener>) {
        self.space_listeners.add(listener);
    }

    pub fn remove_space_listener(&self, listener: &Arc<dyn SpaceRepositoryListener>) -> bool {
        self.space_listeners.remove(listener)
    }

    /// Return context `id`, creating it with `default_space_id` if it does
    /// not exist anywhere in the cluster yet.
    ///
    /// The map insertion decides the winner before anything is materialized:
    /// if the cluster already knows the context, the returned context uses
    /// the cluster's default space id instead of `default_space_id`.
    pub fn create_context(&self, id: ContextId, default_space_id: Uuid) -> Arc<Context> {
        loop {
            match self.map.put_if_absent(id, default_space_id) {
                None => info!(context = %id, default_space = %default_space_id, "context published"),
                Some(existing) if existing != default_space_id => {
                    debug!(context = %id, requested = %default_space_id, %existing, "context already published");
                }
                Some(_) => {}
            }
            if let Some(context) = self.reconcile(id).current {
                return context;
            }
            debug!(context = %id, "context removed while being created, retrying");
        }
    }

    /// Remove context `id` from the cluster and from this kernel.  Returns
    /// `false` if neither the cluster nor this kernel knew it.
    pub fn remove_context(&self, id: &ContextId) -> bool {
        let removed = self.map.remove(id);
        let outcome = self.reconcile(*id);
        let known = removed.is_some() || outcome.retired.is_some();
        if !known {
            debug!(context = %id, "remove of unknown context ignored");
        }
        known
    }

    pub fn context(&self, id: &ContextId) -> Option<Arc<Context>> {
        self.contexts.lock().get(id).cloned()
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.contexts.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Align the local mirror of `id` with the map entry as it is now, then
    /// fire the resulting notifications.
    ///
    /// The map is read under the `contexts` lock, so whichever call takes
    /// the lock last leaves the table matching the newest map state no
    /// matter in which order entry events arrive.
    fn reconcile(&self, id: ContextId) -> Reconciled {
        let outcome = {
            let mut contexts = self.contexts.lock();
            match self.map.get(&id) {
                None => Reconciled {
                    current: None,
                    created: false,
                    retired: contexts.remove(&id),
                },
                Some(default_space_id) => {
                    let current = contexts
                        .get(&id)
                        .filter(|c| c.default_space_id() == default_space_id)
                        .cloned();
                    match current {
                        Some(context) => Reconciled {
                            current: Some(context),
                            created: false,
                            retired: None,
                        },
                        None => {
                            let context = Context::new(
                                id,
                                default_space_id,
                                self.env.clone(),
                                Arc::clone(&self.space_listeners),
                            );
                            let retired = contexts.insert(id, Arc::clone(&context));
                            Reconciled {
                                current: Some(context),
                                created: true,
                                retired,
                            }
                        }
                    }
                }
            }
        };

        if let Some(stale) = &outcome.retired {
            if let Some(current) = &outcome.current {
                warn!(
                    context = %id,
                    stale = %stale.default_space_id(),
                    current = %current.default_space_id(),
                    "replacing context mirror with the cluster's default space"
                );
            }
            self.teardown(stale);
        }
        if outcome.created
            && let Some(context) = &outcome.current
        {
            self.announce(context);
        }
        outcome
    }

    fn announce(&self, context: &Arc<Context>) {
        info!(context = %context.id(), default_space = %context.default_space_id(), "context created");
        for listener in self.context_listeners.snapshot() {
            listener.context_created(context);
        }
        if let Some(space) = context.default_space() {
            for listener in self.space_listeners.snapshot() {
                listener.space_created(&space);
            }
        }
    }

    fn teardown(&self, context: &Arc<Context>) {
        context.spaces().destroy_all();
        info!(context = %context.id(), "context destroyed");
        for listener in self.context_listeners.snapshot() {
            listener.context_destroyed(context);
        }
    }

    fn accepts_remote_events(&self) -> bool {
        matches!(self.lifecycle.get(), ServiceState::Starting | ServiceState::Running)
    }

    fn on_entry_changed(&self, id: ContextId) {
        if self.accepts_remote_events() {
            self.reconcile(id);
        }
    }
}

struct MapListener(Weak<DirectoryService>);

impl EntryListener<ContextId, Uuid> for MapListener {
    fn entry_added(&self, key: &ContextId, _value: &Uuid) {
        if let Some(directory) = self.0.upgrade() {
            directory.on_entry_changed(*key);
        }
    }

    fn entry_removed(&self, key: &ContextId, _value: &Uuid) {
        if let Some(directory) = self.0.upgrade() {
            directory.on_entry_changed(*key);
        }
    }

    fn entry_updated(&self, key: &ContextId, value: &Uuid) {
        if let Some(directory) = self.0.upgrade() {
            warn!(context = %key, default_space = %value, "directory entry overwritten");
            directory.on_entry_changed(*key);
        }
    }
}

#[async_trait]
impl KernelService for DirectoryService {
    fn name(&self) -> &str {
        "directory"
    }

    fn start_priority(&self) -> Option<u32> {
        Some(2)
    }

    fn stop_priority(&self) -> Option<u32> {
        Some(2)
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.get()
    }

    async fn start(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let listener = self.map.add_entry_listener(Arc::new(MapListener(self.this.clone())));
        *self.map_listener.lock() = Some(listener);

        let entries = self.map.entries();
        let count = entries.len();
        for (id, _) in entries {
            self.reconcile(id);
        }
        self.lifecycle.set(ServiceState::Running);
        info!(map = self.map.name(), contexts = count, "directory running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        if let Some(listener) = self.map_listener.lock().take() {
            self.map.remove_entry_listener(listener);
        }
        let detached: Vec<_> = self.contexts.lock().drain().map(|(_, c)| c).collect();
        for context in &detached {
            self.teardown(context);
        }
        self.lifecycle.set(ServiceState::Terminated);
        info!(contexts = detached.len(), "directory stopped");
        Ok(())
    }
}
