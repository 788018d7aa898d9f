//! In-process transport.
//!
//! [`LoopbackNetwork`] is a hub shared by every kernel living in the same
//! process.  Each kernel gets a [`LoopbackTransport`] that implements
//! [`NetworkService`]: publishing hands the event straight to the receivers
//! other transports registered for `(publisher, space)`.

use std::collections::HashSet;
use std::sync::Arc;

use agora_types::{Event, KernelUri, Scope, SpaceId};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::network::{
    NetworkError, NetworkEventReceiver, NetworkService, NetworkStateListener, NetworkTransport,
};

/// First port handed out when resolving a `*` wildcard.
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

struct Subscription {
    subscriber: KernelUri,
    peer: KernelUri,
    space: SpaceId,
    receiver: Arc<dyn NetworkEventReceiver>,
}

struct HubState {
    endpoints: HashSet<KernelUri>,
    subscriptions: Vec<Subscription>,
    next_port: u16,
}

/// Hub connecting the [`LoopbackTransport`]s of one process.
pub struct LoopbackNetwork {
    state: Mutex<HubState>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                endpoints: HashSet::new(),
                subscriptions: Vec::new(),
                next_port: FIRST_EPHEMERAL_PORT,
            }),
        })
    }

    /// Create an unbound transport that will listen on `requested`.
    pub fn transport(self: &Arc<Self>, requested: KernelUri) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            hub: Arc::clone(self),
            requested,
            state: Mutex::new(TransportState {
                local: None,
                listeners: Vec::new(),
            }),
        })
    }

    /// Endpoints currently bound on the hub.
    pub fn endpoints(&self) -> Vec<KernelUri> {
        self.state.lock().endpoints.iter().cloned().collect()
    }

    fn bind(&self, requested: &KernelUri) -> Result<KernelUri, NetworkError> {
        let mut state = self.state.lock();
        let uri = if requested.is_wildcard() {
            loop {
                let candidate = requested.with_port(state.next_port);
                state.next_port = state.next_port.wrapping_add(1);
                if !state.endpoints.contains(&candidate) {
                    break candidate;
                }
            }
        } else {
            requested.clone()
        };
        if !state.endpoints.insert(uri.clone()) {
            return Err(NetworkError::Transport(format!("{uri} is already bound")));
        }
        Ok(uri)
    }

    fn unbind(&self, uri: &KernelUri) {
        let mut state = self.state.lock();
        state.endpoints.remove(uri);
        state
            .subscriptions
            .retain(|s| &s.subscriber != uri && &s.peer != uri);
    }

    fn deliver(&self, from: &KernelUri, space: &SpaceId, scope: Arc<dyn Scope>, event: &Event) {
        let receivers: Vec<_> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|s| &s.peer == from && &s.space == space)
            .map(|s| Arc::clone(&s.receiver))
            .collect();
        trace!(%from, %space, receivers = receivers.len(), "loopback delivery");
        for receiver in receivers {
            receiver.receive_remote(space, Arc::clone(&scope), event.clone());
        }
    }

    fn subscribe(&self, subscription: Subscription) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if !state.endpoints.contains(&subscription.peer) {
            return Err(NetworkError::UnknownPeer(subscription.peer));
        }
        state.subscriptions.retain(|s| {
            !(s.subscriber == subscription.subscriber
                && s.peer == subscription.peer
                && s.space == subscription.space)
        });
        state.subscriptions.push(subscription);
        Ok(())
    }

    fn unsubscribe(&self, subscriber: &KernelUri, peer: &KernelUri, space: Option<&SpaceId>) {
        self.state.lock().subscriptions.retain(|s| {
            let hit = &s.subscriber == subscriber
                && &s.peer == peer
                && space.is_none_or(|sp| &s.space == sp);
            !hit
        });
    }
}

struct TransportState {
    local: Option<KernelUri>,
    listeners: Vec<Arc<dyn NetworkStateListener>>,
}

/// One kernel's endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    hub: Arc<LoopbackNetwork>,
    requested: KernelUri,
    state: Mutex<TransportState>,
}

impl LoopbackTransport {
    /// Bind the endpoint and signal `running` to the state listeners.
    ///
    /// Binding an already bound transport returns the existing endpoint and
    /// does not signal again.
    pub fn bind(&self) -> Result<KernelUri, NetworkError> {
        let (uri, listeners) = {
            let mut state = self.state.lock();
            if let Some(uri) = &state.local {
                return Ok(uri.clone());
            }
            let uri = self.hub.bind(&self.requested)?;
            state.local = Some(uri.clone());
            (uri, state.listeners.clone())
        };
        info!(uri = %uri, "loopback transport running");
        for listener in listeners {
            listener.running(&uri);
        }
        Ok(uri)
    }

    /// Unbind the endpoint, dropping every subscription that involves it.
    pub fn shutdown(&self) {
        let (uri, listeners) = {
            let mut state = self.state.lock();
            match state.local.take() {
                Some(uri) => (uri, state.listeners.clone()),
                None => return,
            }
        };
        self.hub.unbind(&uri);
        debug!(uri = %uri, "loopback transport stopped");
        for listener in listeners {
            listener.stopped();
        }
    }

    fn require_local(&self) -> Result<KernelUri, NetworkError> {
        self.state.lock().local.clone().ok_or(NetworkError::NotReady)
    }
}

impl NetworkService for LoopbackTransport {
    fn publish(&self, space: &SpaceId, scope: Arc<dyn Scope>, event: &Event) -> Result<(), NetworkError> {
        let local = self.require_local()?;
        self.hub.deliver(&local, space, scope, event);
        Ok(())
    }

    fn connect_to_remote_space(
        &self,
        peer: &KernelUri,
        space: &SpaceId,
        receiver: Arc<dyn NetworkEventReceiver>,
    ) -> Result<(), NetworkError> {
        let subscriber = self.require_local()?;
        self.hub.subscribe(Subscription {
            subscriber,
            peer: peer.clone(),
            space: space.clone(),
            receiver,
        })
    }

    fn disconnect(&self, peer: &KernelUri) -> Result<(), NetworkError> {
        let subscriber = self.require_local()?;
        self.hub.unsubscribe(&subscriber, peer, None);
        Ok(())
    }

    fn disconnect_space(&self, peer: &KernelUri, space: &SpaceId) -> Result<(), NetworkError> {
        let subscriber = self.require_local()?;
        self.hub.unsubscribe(&subscriber, peer, Some(space));
        Ok(())
    }

    fn local_uri(&self) -> Option<KernelUri> {
        self.state.lock().local.clone()
    }

    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>) {
        self.state.lock().listeners.push(listener);
    }
}

impl NetworkTransport for LoopbackTransport {
    fn bind(&self) -> Result<KernelUri, NetworkError> {
        LoopbackTransport::bind(self)
    }

    fn shutdown(&self) {
        LoopbackTransport::shutdown(self)
    }
}
