//! Participant registries – per-space bindings between participants and
//! their addresses.
//!
//! | Variant | Addresses per participant | `register` on a bound participant |
//! |---|---|---|
//! | [`UniqueAddressRegistry`] | exactly one | replaces the old address (last write wins) |
//! | [`MultiAddressRegistry`] | any number | adds the address to the set |
//!
//! An address belongs to at most one participant.  Registering an address
//! that another participant holds moves it to the new participant and the
//! previous holder is reported as having left it.
//!
//! Every mutation runs under the registry's own mutex.  Read accessors
//! return owned snapshots taken under that mutex, so callers never need to
//! hold it while iterating.  [`ParticipantListener`]s are notified after the
//! mutex has been released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use agora_types::{Address, Event, TaskError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::listeners::ListenerList;

// ────────────────────────────────────────────────────────────────────────────
// Contracts
// ────────────────────────────────────────────────────────────────────────────

/// An entity that can be addressed inside a space and receive its events.
pub trait Participant: Send + Sync {
    fn id(&self) -> Uuid;

    /// Handle one event.  Runs on the executor; an `Err` is reported through
    /// the executor's outcome classification.
    fn receive_event(&self, event: &Event) -> Result<(), TaskError>;
}

/// Observer of registry membership changes.
pub trait ParticipantListener: Send + Sync {
    fn participant_joined(&self, _address: &Address, _participant: Uuid) {}
    fn participant_left(&self, _address: &Address, _participant: Uuid) {}
}

/// Which registry flavour new spaces use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Unique,
    Multi,
}

impl RegistryKind {
    pub fn build(self) -> Arc<dyn ParticipantRegistry> {
        match self {
            RegistryKind::Unique => Arc::new(UniqueAddressRegistry::default()),
            RegistryKind::Multi => Arc::new(MultiAddressRegistry::default()),
        }
    }
}

impl std::str::FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unique" => Ok(RegistryKind::Unique),
            "multi" => Ok(RegistryKind::Multi),
            other => Err(format!("unknown registry kind '{other}' (expected unique or multi)")),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKind::Unique => f.write_str("unique"),
            RegistryKind::Multi => f.write_str("multi"),
        }
    }
}

/// Contract shared by both registry variants.
pub trait ParticipantRegistry: Send + Sync {
    /// Bind `participant` to `address` and return the address.
    fn register(&self, address: Address, participant: Arc<dyn Participant>) -> Address;

    /// Remove one binding.  Returns `false` if it did not exist.
    fn unregister_address(&self, address: &Address, participant: Uuid) -> bool;

    /// Remove every binding of `participant` and return the removed
    /// addresses.  Unknown participants yield an empty list.
    fn unregister(&self, participant: Uuid) -> Vec<Address>;

    /// Snapshot of the addresses bound to `participant`, possibly empty.
    fn addresses_of(&self, participant: Uuid) -> Vec<Address>;

    fn participant_ids(&self) -> Vec<Uuid>;

    /// Snapshot of every `(address, participant)` binding, used as the
    /// delivery target list.
    fn bindings(&self) -> Vec<(Address, Arc<dyn Participant>)>;

    fn is_empty(&self) -> bool;

    fn add_listener(&self, listener: Arc<dyn ParticipantListener>);
}

enum Change {
    Joined(Address, Uuid),
    Left(Address, Uuid),
}

fn notify(listeners: &ListenerList<dyn ParticipantListener>, changes: Vec<Change>) {
    if changes.is_empty() {
        return;
    }
    let listeners = listeners.snapshot();
    for change in changes {
        match change {
            Change::Joined(address, id) => {
                trace!(participant = %id, address = %address, "participant joined");
                for l in &listeners {
                    l.participant_joined(&address, id);
                }
            }
            Change::Left(address, id) => {
                trace!(participant = %id, address = %address, "participant left");
                for l in &listeners {
                    l.participant_left(&address, id);
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// UniqueAddressRegistry
// ────────────────────────────────────────────────────────────────────────────

struct UniqueBinding {
    address: Address,
    participant: Arc<dyn Participant>,
}

/// One address per participant.
#[derive(Default)]
pub struct UniqueAddressRegistry {
    bindings: Mutex<HashMap<Uuid, UniqueBinding>>,
    listeners: ListenerList<dyn ParticipantListener>,
}

impl UniqueAddressRegistry {
    /// The participant's single address, if registered.
    pub fn address_of(&self, participant: Uuid) -> Option<Address> {
        self.bindings.lock().get(&participant).map(|b| b.address.clone())
    }
}

impl ParticipantRegistry for UniqueAddressRegistry {
    fn register(&self, address: Address, participant: Arc<dyn Participant>) -> Address {
        let id = participant.id();
        let mut changes = Vec::new();
        {
            let mut bindings = self.bindings.lock();
            let holder = bindings
                .iter()
                .find(|(owner, b)| **owner != id && b.address == address)
                .map(|(owner, _)| *owner);
            if let Some(holder) = holder
                && let Some(old) = bindings.remove(&holder)
            {
                debug!(participant = %id, previous = %holder, address = %address, "address taken over");
                changes.push(Change::Left(old.address, holder));
            }
            let previous = bindings.insert(
                id,
                UniqueBinding {
                    address: address.clone(),
                    participant,
                },
            );
            match previous {
                Some(old) if old.address == address => {}
                Some(old) => {
                    debug!(participant = %id, from = %old.address, to = %address, "address replaced");
                    changes.push(Change::Left(old.address, id));
                    changes.push(Change::Joined(address.clone(), id));
                }
                None => changes.push(Change::Joined(address.clone(), id)),
            }
        }
        notify(&self.listeners, changes);
        address
    }

    fn unregister_address(&self, address: &Address, participant: Uuid) -> bool {
        let removed = {
            let mut bindings = self.bindings.lock();
            let bound_here = bindings
                .get(&participant)
                .is_some_and(|b| &b.address == address);
            if bound_here { bindings.remove(&participant) } else { None }
        };
        match removed {
            Some(b) => {
                notify(&self.listeners, vec![Change::Left(b.address, participant)]);
                true
            }
            None => false,
        }
    }

    fn unregister(&self, participant: Uuid) -> Vec<Address> {
        let removed = self.bindings.lock().remove(&participant);
        match removed {
            Some(b) => {
                notify(&self.listeners, vec![Change::Left(b.address.clone(), participant)]);
                vec![b.address]
            }
            None => Vec::new(),
        }
    }

    fn addresses_of(&self, participant: Uuid) -> Vec<Address> {
        self.address_of(participant).into_iter().collect()
    }

    fn participant_ids(&self) -> Vec<Uuid> {
        self.bindings.lock().keys().copied().collect()
    }

    fn bindings(&self) -> Vec<(Address, Arc<dyn Participant>)> {
        self.bindings
            .lock()
            .values()
            .map(|b| (b.address.clone(), Arc::clone(&b.participant)))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.bindings.lock().is_empty()
    }

    fn add_listener(&self, listener: Arc<dyn ParticipantListener>) {
        self.listeners.add(listener);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MultiAddressRegistry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MultiState {
    addresses: HashMap<Uuid, Vec<Address>>,
    participants: HashMap<Address, Arc<dyn Participant>>,
}

/// Any number of addresses per participant, e.g. for replicated roles.
#[derive(Default)]
pub struct MultiAddressRegistry {
    state: Mutex<MultiState>,
    listeners: ListenerList<dyn ParticipantListener>,
}

impl ParticipantRegistry for MultiAddressRegistry {
    fn register(&self, address: Address, participant: Arc<dyn Participant>) -> Address {
        let id = participant.id();
        let mut changes = Vec::new();
        {
            let mut state = self.state.lock();
            let holder = state
                .participants
                .insert(address.clone(), participant)
                .map(|previous| previous.id())
                .filter(|holder| *holder != id);
            if let Some(holder) = holder {
                if let Some(set) = state.addresses.get_mut(&holder) {
                    set.retain(|a| a != &address);
                    if set.is_empty() {
                        state.addresses.remove(&holder);
                    }
                }
                debug!(participant = %id, previous = %holder, address = %address, "address taken over");
                changes.push(Change::Left(address.clone(), holder));
            }
            let set = state.addresses.entry(id).or_default();
            if !set.contains(&address) {
                set.push(address.clone());
                changes.push(Change::Joined(address.clone(), id));
            }
        }
        notify(&self.listeners, changes);
        address
    }

    fn unregister_address(&self, address: &Address, participant: Uuid) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(set) = state.addresses.get_mut(&participant) else {
                return false;
            };
            let before = set.len();
            set.retain(|a| a != address);
            let removed = set.len() != before;
            if set.is_empty() {
                state.addresses.remove(&participant);
            }
            if removed {
                state.participants.remove(address);
            }
            removed
        };
        if removed {
            notify(&self.listeners, vec![Change::Left(address.clone(), participant)]);
        }
        removed
    }

    fn unregister(&self, participant: Uuid) -> Vec<Address> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.addresses.remove(&participant).unwrap_or_default();
            for address in &removed {
                state.participants.remove(address);
            }
            removed
        };
        notify(
            &self.listeners,
            removed.iter().map(|a| Change::Left(a.clone(), participant)).collect(),
        );
        removed
    }

    fn addresses_of(&self, participant: Uuid) -> Vec<Address> {
        self.state
            .lock()
            .addresses
            .get(&participant)
            .cloned()
            .unwrap_or_default()
    }

    fn participant_ids(&self) -> Vec<Uuid> {
        self.state.lock().addresses.keys().copied().collect()
    }

    fn bindings(&self) -> Vec<(Address, Arc<dyn Participant>)> {
        self.state
            .lock()
            .participants
            .iter()
            .map(|(a, p)| (a.clone(), Arc::clone(p)))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.state.lock().addresses.is_empty()
    }

    fn add_listener(&self, listener: Arc<dyn ParticipantListener>) {
        self.listeners.add(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::SpaceId;

    struct Agent(Uuid);

    impl Participant for Agent {
        fn id(&self) -> Uuid {
            self.0
        }
        fn receive_event(&self, _event: &Event) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        joined: Mutex<Vec<Address>>,
        left: Mutex<Vec<Address>>,
    }

    impl ParticipantListener for Recorder {
        fn participant_joined(&self, address: &Address, _participant: Uuid) {
            self.joined.lock().push(address.clone());
        }
        fn participant_left(&self, address: &Address, _participant: Uuid) {
            self.left.lock().push(address.clone());
        }
    }

    fn two_addresses(participant: Uuid) -> (Address, Address) {
        let space = SpaceId::event_space(Uuid::new_v4(), Uuid::new_v4());
        (
            Address::new(space.clone(), participant),
            Address::with_id(space, participant, Uuid::new_v4()),
        )
    }

    #[test]
    fn unique_registry_keeps_the_last_address() {
        let registry = UniqueAddressRegistry::default();
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(recorder.clone());
        let id = Uuid::new_v4();
        let (a1, a2) = two_addresses(id);

        registry.register(a1.clone(), Arc::new(Agent(id)));
        registry.register(a2.clone(), Arc::new(Agent(id)));

        assert_eq!(registry.addresses_of(id), vec![a2.clone()]);
        assert_eq!(registry.address_of(id), Some(a2.clone()));
        assert_eq!(*recorder.joined.lock(), vec![a1.clone(), a2]);
        assert_eq!(*recorder.left.lock(), vec![a1]);
    }

    #[test]
    fn multi_registry_keeps_every_address() {
        let registry = MultiAddressRegistry::default();
        let id = Uuid::new_v4();
        let (a1, a2) = two_addresses(id);

        registry.register(a1.clone(), Arc::new(Agent(id)));
        registry.register(a2.clone(), Arc::new(Agent(id)));
        registry.register(a2.clone(), Arc::new(Agent(id)));

        assert_eq!(registry.addresses_of(id), vec![a1.clone(), a2.clone()]);
        assert_eq!(registry.bindings().len(), 2);

        assert!(registry.unregister_address(&a1, id));
        assert_eq!(registry.addresses_of(id), vec![a2]);
    }

    #[test]
    fn removal_is_idempotent() {
        let unique = UniqueAddressRegistry::default();
        let multi = MultiAddressRegistry::default();
        let id = Uuid::new_v4();
        let (a1, _) = two_addresses(id);

        for registry in [&unique as &dyn ParticipantRegistry, &multi] {
            registry.register(a1.clone(), Arc::new(Agent(id)));
            assert_eq!(registry.unregister(id), vec![a1.clone()]);
            assert!(registry.unregister(id).is_empty());
            assert!(!registry.unregister_address(&a1, id));
            assert!(registry.addresses_of(id).is_empty());
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn unique_unregister_ignores_stale_address() {
        let registry = UniqueAddressRegistry::default();
        let id = Uuid::new_v4();
        let (a1, a2) = two_addresses(id);
        registry.register(a1.clone(), Arc::new(Agent(id)));
        registry.register(a2, Arc::new(Agent(id)));

        assert!(!registry.unregister_address(&a1, id));
        assert_eq!(registry.participant_ids(), vec![id]);
    }

    #[test]
    fn listener_may_reenter_registry() {
        struct Reader(Arc<UniqueAddressRegistry>, Mutex<usize>);
        impl ParticipantListener for Reader {
            fn participant_joined(&self, _address: &Address, participant: Uuid) {
                *self.1.lock() = self.0.addresses_of(participant).len();
            }
        }

        let registry = Arc::new(UniqueAddressRegistry::default());
        let reader = Arc::new(Reader(Arc::clone(&registry), Mutex::new(0)));
        registry.add_listener(reader.clone());
        let id = Uuid::new_v4();
        let (a1, _) = two_addresses(id);
        registry.register(a1, Arc::new(Agent(id)));
        assert_eq!(*reader.1.lock(), 1);
    }

    #[test]
    fn address_moves_to_its_new_holder() {
        let unique = UniqueAddressRegistry::default();
        let multi = MultiAddressRegistry::default();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let (shared, _) = two_addresses(first);

        for registry in [&unique as &dyn ParticipantRegistry, &multi] {
            let recorder = Arc::new(Recorder::default());
            registry.add_listener(recorder.clone());
            registry.register(shared.clone(), Arc::new(Agent(first)));
            registry.register(shared.clone(), Arc::new(Agent(second)));

            assert!(registry.addresses_of(first).is_empty());
            assert_eq!(registry.addresses_of(second), vec![shared.clone()]);
            assert_eq!(*recorder.left.lock(), vec![shared.clone()]);

            // The previous holder no longer owns the binding.
            assert!(registry.unregister(first).is_empty());
            let bindings = registry.bindings();
            assert_eq!(bindings.len(), 1);
            assert_eq!(bindings[0].1.id(), second);
            assert_eq!(registry.unregister(second), vec![shared.clone()]);
            assert!(registry.is_empty());
        }
    }

    #[test]
    fn registry_kind_builds_matching_variant() {
        let id = Uuid::new_v4();
        let (a1, a2) = two_addresses(id);
        let multi = RegistryKind::Multi.build();
        multi.register(a1.clone(), Arc::new(Agent(id)));
        multi.register(a2.clone(), Arc::new(Agent(id)));
        assert_eq!(multi.addresses_of(id).len(), 2);

        let unique = RegistryKind::default().build();
        unique.register(a1, Arc::new(Agent(id)));
        unique.register(a2, Arc::new(Agent(id)));
        assert_eq!(unique.addresses_of(id).len(), 1);
        assert_eq!(RegistryKind::Multi.to_string(), "multi");
        assert_eq!("Multi".parse::<RegistryKind>(), Ok(RegistryKind::Multi));
        assert!("sharded".parse::<RegistryKind>().is_err());
    }
}
