//! [`NetworkBridge`] – keeps every local space subscribed to the same space
//! on every known peer.
//!
//! | Event | Action |
//! |---|---|
//! | peer discovered | connect every local space to the peer |
//! | peer disconnected | drop every connection to the peer |
//! | space created | connect the space to every known peer |
//! | space destroyed | disconnect the space from every known peer |
//!
//! Inbound events reach [`EventSpace`] through its
//! [`NetworkEventReceiver`] implementation and are dispatched locally only.

use std::sync::{Arc, Weak};

use agora_middleware::{NetworkEventReceiver, NetworkService};
use agora_types::{AgoraError, KernelUri};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::directory::{DirectoryService, SpaceRepositoryListener};
use crate::discovery::{PeerDiscovery, PeerListener};
use crate::service::{KernelService, Lifecycle, ServiceState};
use crate::space::EventSpace;

struct Registration {
    peers: Arc<dyn PeerListener>,
    spaces: Arc<dyn SpaceRepositoryListener>,
}

pub struct NetworkBridge {
    this: Weak<NetworkBridge>,
    directory: Arc<DirectoryService>,
    discovery: Arc<PeerDiscovery>,
    network: Arc<dyn NetworkService>,
    lifecycle: Lifecycle,
    registration: Mutex<Option<Registration>>,
}

impl NetworkBridge {
    pub fn new(
        directory: Arc<DirectoryService>,
        discovery: Arc<PeerDiscovery>,
        network: Arc<dyn NetworkService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            directory,
            discovery,
            network,
            lifecycle: Lifecycle::default(),
            registration: Mutex::new(None),
        })
    }

    fn local_spaces(&self) -> Vec<Arc<EventSpace>> {
        self.directory
            .contexts()
            .iter()
            .flat_map(|c| c.spaces().spaces())
            .collect()
    }

    fn connect(&self, peer: &KernelUri, space: &Arc<EventSpace>) {
        let receiver: Arc<dyn NetworkEventReceiver> = Arc::clone(space) as Arc<dyn NetworkEventReceiver>;
        match self.network.connect_to_remote_space(peer, space.id(), receiver) {
            Ok(()) => debug!(%peer, space = %space.id(), "space connected"),
            Err(e) => warn!(%peer, space = %space.id(), error = %e, "space connection failed"),
        }
    }

    fn on_peer_discovered(&self, peer: &KernelUri) {
        if !self.lifecycle.is_running() {
            return;
        }
        for space in self.local_spaces() {
            self.connect(peer, &space);
        }
    }

    fn on_peer_disconnected(&self, peer: &KernelUri) {
        if let Err(e) = self.network.disconnect(peer) {
            debug!(%peer, error = %e, "disconnect failed");
        }
    }

    fn on_space_created(&self, space: &Arc<EventSpace>) {
        if !self.lifecycle.is_running() {
            return;
        }
        for peer in self.discovery.peers() {
            self.connect(&peer, space);
        }
    }

    fn on_space_destroyed(&self, space: &Arc<EventSpace>) {
        for peer in self.discovery.peers() {
            if let Err(e) = self.network.disconnect_space(&peer, space.id()) {
                debug!(%peer, space = %space.id(), error = %e, "space disconnect failed");
            }
        }
    }
}

struct Adapter(Weak<NetworkBridge>);

impl PeerListener for Adapter {
    fn peer_discovered(&self, peer: &KernelUri) {
        if let Some(bridge) = self.0.upgrade() {
            bridge.on_peer_discovered(peer);
        }
    }

    fn peer_disconnected(&self, peer: &KernelUri) {
        if let Some(bridge) = self.0.upgrade() {
            bridge.on_peer_disconnected(peer);
        }
    }
}

impl SpaceRepositoryListener for Adapter {
    fn space_created(&self, space: &Arc<EventSpace>) {
        if let Some(bridge) = self.0.upgrade() {
            bridge.on_space_created(space);
        }
    }

    fn space_destroyed(&self, space: &Arc<EventSpace>) {
        if let Some(bridge) = self.0.upgrade() {
            bridge.on_space_destroyed(space);
        }
    }
}

#[async_trait]
impl KernelService for NetworkBridge {
    fn name(&self) -> &str {
        "network-bridge"
    }

    fn start_priority(&self) -> Option<u32> {
        Some(3)
    }

    fn stop_priority(&self) -> Option<u32> {
        Some(1)
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.get()
    }

    async fn start(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let registration = Registration {
            peers: Arc::new(Adapter(self.this.clone())),
            spaces: Arc::new(Adapter(self.this.clone())),
        };
        self.discovery.add_peer_listener(Arc::clone(&registration.peers));
        self.directory.add_space_listener(Arc::clone(&registration.spaces));
        *self.registration.lock() = Some(registration);
        self.lifecycle.set(ServiceState::Running);

        let peers = self.discovery.peers();
        for peer in &peers {
            self.on_peer_discovered(peer);
        }
        info!(peers = peers.len(), "network bridge running");
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        if let Some(registration) = self.registration.lock().take() {
            self.discovery.remove_peer_listener(&registration.peers);
            self.directory.remove_space_listener(&registration.spaces);
        }
        for peer in self.discovery.peers() {
            self.on_peer_disconnected(&peer);
        }
        self.lifecycle.set(ServiceState::Terminated);
        info!("network bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_middleware::{
        DistributedDataProvider, ExecutorService, InMemoryCluster, LoopbackNetwork, LoopbackTransport,
    };
    use agora_types::{Event, TaskError};
    use std::time::Duration;
    use tokio::runtime::Handle;
    use uuid::Uuid;

    use crate::registry::{Participant, RegistryKind};
    use crate::space::SpaceEnvironment;

    struct Inbox {
        id: Uuid,
        events: Mutex<Vec<Event>>,
    }

    impl Participant for Inbox {
        fn id(&self) -> Uuid {
            self.id
        }
        fn receive_event(&self, event: &Event) -> Result<(), TaskError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct Node {
        transport: Arc<LoopbackTransport>,
        directory: Arc<DirectoryService>,
        discovery: Arc<PeerDiscovery>,
        bridge: Arc<NetworkBridge>,
    }

    async fn node(cluster: &Arc<InMemoryCluster>, hub: &Arc<LoopbackNetwork>) -> Result<Node, AgoraError> {
        let executor = ExecutorService::new(Handle::current());
        let member = cluster.join();
        let transport = hub.transport(KernelUri::new("tcp", "127.0.0.1", None));
        let network: Arc<dyn NetworkService> = transport.clone();
        let discovery = PeerDiscovery::new(cluster.kernel_map("agora"), member, network.clone(), executor.clone());
        let directory = DirectoryService::new(
            cluster.context_map("agora"),
            SpaceEnvironment {
                executor,
                network: network.clone(),
                registry_kind: RegistryKind::Unique,
            },
        );
        let bridge = NetworkBridge::new(directory.clone(), discovery.clone(), network);
        discovery.start().await?;
        directory.start().await?;
        bridge.start().await?;
        transport.bind()?;
        Ok(Node {
            transport,
            directory,
            discovery,
            bridge,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_cross_to_peers_in_both_directions() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let b = node(&cluster, &hub).await?;
        settle().await;

        let context = Uuid::new_v4();
        let on_a = a.directory.create_context(context, Uuid::new_v4());
        settle().await;
        let on_b = b.directory.context(&context).ok_or("context not mirrored on b")?;

        let space_a = on_a.default_space().ok_or("no default space on a")?;
        let space_b = on_b.default_space().ok_or("no default space on b")?;
        let alice = Arc::new(Inbox {
            id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
        });
        let bob = Arc::new(Inbox {
            id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
        });
        let alice_address = space_a.register(alice.clone());
        let bob_address = space_b.register(bob.clone());

        space_a.emit(Event::new("hello", serde_json::Value::Null).with_source(alice_address), None)?;
        space_b.emit(Event::new("hi", serde_json::Value::Null).with_source(bob_address), None)?;
        settle().await;

        let kinds = |inbox: &Inbox| inbox.events.lock().iter().map(|e| e.kind.clone()).collect::<Vec<_>>();
        let mut at_alice = kinds(&alice);
        at_alice.sort();
        let mut at_bob = kinds(&bob);
        at_bob.sort();
        assert_eq!(at_alice, vec!["hello".to_string(), "hi".to_string()]);
        assert_eq!(at_bob, vec!["hello".to_string(), "hi".to_string()]);
        assert_eq!(a.discovery.peers().len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stopped_bridge_no_longer_receives() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let b = node(&cluster, &hub).await?;
        settle().await;

        let context = Uuid::new_v4();
        let on_a = a.directory.create_context(context, Uuid::new_v4());
        settle().await;
        let on_b = b.directory.context(&context).ok_or("context not mirrored on b")?;
        let bob = Arc::new(Inbox {
            id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
        });
        on_b.default_space().ok_or("no default space on b")?.register(bob.clone());

        b.bridge.stop().await?;
        assert_eq!(b.bridge.state(), ServiceState::Terminated);

        let space_a = on_a.default_space().ok_or("no default space on a")?;
        let source = space_a.register(Arc::new(Inbox {
            id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
        }));
        space_a.emit(Event::new("late", serde_json::Value::Null).with_source(source), None)?;
        settle().await;
        assert!(bob.events.lock().is_empty());
        assert!(b.transport.local_uri().is_some());
        Ok(())
    }
}
