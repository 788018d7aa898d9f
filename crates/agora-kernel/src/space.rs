//! [`EventSpace`] – a communication channel inside a context and its scoped
//! event router.
//!
//! `emit(event, scope)` always attempts both legs of the fan-out:
//!
//! 1. the event source must be an address of this space, otherwise
//!    [`AgoraError::ForeignSource`];
//! 2. the `(space, scope, event)` triple is published to the network.  A
//!    publish failure is logged and local delivery still happens;
//! 3. every registered address the scope matches gets its own executor task
//!    calling [`Participant::receive_event`].  The router does not wait for
//!    those tasks.
//!
//! Events arriving from a peer run step 3 only and are never re-published.

use std::sync::Arc;

use agora_middleware::{ExecutorService, NetworkEventReceiver, NetworkService};
use agora_types::{Address, AgoraError, AllScope, Event, Scope, SpaceId};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::registry::{Participant, ParticipantListener, ParticipantRegistry, RegistryKind};

/// Collaborators every space of a kernel shares.
#[derive(Clone)]
pub struct SpaceEnvironment {
    pub executor: ExecutorService,
    pub network: Arc<dyn NetworkService>,
    pub registry_kind: RegistryKind,
}

pub struct EventSpace {
    id: SpaceId,
    registry: Arc<dyn ParticipantRegistry>,
    executor: ExecutorService,
    network: Arc<dyn NetworkService>,
}

impl EventSpace {
    pub fn new(id: SpaceId, env: &SpaceEnvironment) -> Arc<Self> {
        Arc::new(Self {
            id,
            registry: env.registry_kind.build(),
            executor: env.executor.clone(),
            network: Arc::clone(&env.network),
        })
    }

    pub fn id(&self) -> &SpaceId {
        &self.id
    }

    /// Register `participant` under its canonical address in this space.
    pub fn register(&self, participant: Arc<dyn Participant>) -> Address {
        let address = Address::new(self.id.clone(), participant.id());
        self.registry.register(address, participant)
    }

    /// Register `participant` under an explicit address of this space.
    pub fn register_at(&self, address: Address, participant: Arc<dyn Participant>) -> Result<Address, AgoraError> {
        if address.space != self.id {
            return Err(AgoraError::UnknownSpace(address.space));
        }
        Ok(self.registry.register(address, participant))
    }

    pub fn unregister(&self, participant: Uuid) -> Vec<Address> {
        self.registry.unregister(participant)
    }

    pub fn unregister_address(&self, address: &Address, participant: Uuid) -> bool {
        self.registry.unregister_address(address, participant)
    }

    pub fn addresses_of(&self, participant: Uuid) -> Vec<Address> {
        self.registry.addresses_of(participant)
    }

    pub fn participant_ids(&self) -> Vec<Uuid> {
        self.registry.participant_ids()
    }

    pub fn add_participant_listener(&self, listener: Arc<dyn ParticipantListener>) {
        self.registry.add_listener(listener);
    }

    /// Emit `event` to the participants `scope` selects, here and on every
    /// connected peer.  `None` selects everyone.  Returns the number of local
    /// deliveries submitted.
    pub fn emit(&self, event: Event, scope: Option<Arc<dyn Scope>>) -> Result<usize, AgoraError> {
        match &event.source {
            Some(source) if source.space == self.id => {}
            origin => {
                return Err(AgoraError::ForeignSource {
                    space: self.id.clone(),
                    origin: origin.clone(),
                });
            }
        }
        let scope = scope.unwrap_or_else(|| Arc::new(AllScope) as Arc<dyn Scope>);

        if let Err(e) = self.network.publish(&self.id, Arc::clone(&scope), &event) {
            warn!(space = %self.id, event = %event.id, error = %e, "network publish failed");
        }

        Ok(self.dispatch_local(event, scope.as_ref()))
    }

    /// Drop every participant binding.  Called when the space is destroyed.
    pub(crate) fn clear(&self) {
        for participant in self.registry.participant_ids() {
            self.registry.unregister(participant);
        }
    }

    fn dispatch_local(&self, event: Event, scope: &dyn Scope) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for (address, participant) in self.registry.bindings() {
            if !scope.matches(&address) {
                continue;
            }
            let event = Arc::clone(&event);
            self.executor.submit(move || participant.receive_event(&event));
            delivered += 1;
        }
        if delivered == 0 {
            debug!(space = %self.id, event = %event.id, kind = %event.kind, "no local participant matched");
        } else {
            trace!(space = %self.id, event = %event.id, delivered, "local dispatch submitted");
        }
        delivered
    }
}

impl NetworkEventReceiver for EventSpace {
    fn receive_remote(&self, space: &SpaceId, scope: Arc<dyn Scope>, event: Event) {
        if space != &self.id {
            warn!(expected = %self.id, got = %space, "remote event for another space dropped");
            return;
        }
        self.dispatch_local(event, scope.as_ref());
    }
}
