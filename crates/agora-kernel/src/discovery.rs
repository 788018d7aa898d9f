//! [`PeerDiscovery`] – publishes this kernel's endpoint into the replicated
//! kernel map and tracks every other live kernel.
//!
//! Discovery is `NOT_READY` until the transport signals `running(uri)`.  The
//! transition to `READY` happens once:
//!
//! 1. the local endpoint is recorded;
//! 2. listeners are told, synchronously, about every endpoint already in the
//!    kernel map except this kernel's own;
//! 3. the local `member → endpoint` mapping is inserted with put-if-absent.
//!
//! After that, kernel-map insertions and removals made by other kernels are
//! turned into `peer_discovered` / `peer_disconnected` notifications that run
//! on the executor.  When cluster membership reports a member gone, its
//! kernel-map entry is removed, which in turn produces `peer_disconnected`
//! on every surviving kernel.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use agora_middleware::{
    ClusterMembership, DistributedMap, EntryListener, ExecutorService, ListenerId, MembershipListener,
    NetworkService, NetworkStateListener,
};
use agora_types::{AgoraError, KernelUri, MemberAddress};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::listeners::ListenerList;
use crate::service::{KernelService, Lifecycle, ServiceState};

/// Observer of peer kernels coming and going.
pub trait PeerListener: Send + Sync {
    fn peer_discovered(&self, _peer: &KernelUri) {}
    fn peer_disconnected(&self, _peer: &KernelUri) {}
}

#[derive(Default)]
struct DiscoveryState {
    ready: bool,
    local_uri: Option<KernelUri>,
    peers: HashMap<MemberAddress, KernelUri>,
    map_listener: Option<ListenerId>,
    /// Membership and transport offer no way to unsubscribe, so their
    /// adapters are installed on the first start and stay for good.
    hooks_installed: bool,
}

pub struct PeerDiscovery {
    this: Weak<PeerDiscovery>,
    kernels: Arc<dyn DistributedMap<MemberAddress, KernelUri>>,
    membership: Arc<dyn ClusterMembership>,
    network: Arc<dyn NetworkService>,
    executor: ExecutorService,
    state: Mutex<DiscoveryState>,
    lifecycle: Lifecycle,
    listeners: ListenerList<dyn PeerListener>,
}

impl PeerDiscovery {
    pub fn new(
        kernels: Arc<dyn DistributedMap<MemberAddress, KernelUri>>,
        membership: Arc<dyn ClusterMembership>,
        network: Arc<dyn NetworkService>,
        executor: ExecutorService,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            kernels,
            membership,
            network,
            executor,
            state: Mutex::new(DiscoveryState::default()),
            lifecycle: Lifecycle::default(),
            listeners: ListenerList::default(),
        })
    }

    pub fn add_peer_listener(&self, listener: Arc<dyn PeerListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_peer_listener(&self, listener: &Arc<dyn PeerListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    pub fn local_uri(&self) -> Option<KernelUri> {
        self.state.lock().local_uri.clone()
    }

    /// Snapshot of the endpoints of every known peer, this kernel excluded.
    pub fn peers(&self) -> Vec<KernelUri> {
        self.state.lock().peers.values().cloned().collect()
    }

    /// Enter `READY`.  Further calls are no-ops.
    pub fn network_ready(&self, local_uri: &KernelUri) {
        {
            let mut state = self.state.lock();
            if state.ready {
                debug!(uri = %local_uri, "duplicate network ready signal ignored");
                return;
            }
            state.ready = true;
            state.local_uri = Some(local_uri.clone());
        }

        // Entries landing from here on are also reported by the map listener;
        // the peer cache keeps each endpoint from being announced twice.
        let existing = self.kernels.entries();
        let (backfill, listeners) = {
            let mut state = self.state.lock();
            let backfill: Vec<KernelUri> = existing
                .into_iter()
                .filter(|(_, uri)| uri != local_uri)
                .filter_map(|(member, uri)| match state.peers.insert(member, uri.clone()) {
                    Some(previous) if previous == uri => None,
                    _ => Some(uri),
                })
                .collect();
            (backfill, self.listeners.snapshot())
        };
        for peer in &backfill {
            for listener in &listeners {
                listener.peer_discovered(peer);
            }
        }

        let member = self.membership.local_member();
        if let Some(other) = self.kernels.put_if_absent(member, local_uri.clone()) {
            warn!(%member, registered = %other, uri = %local_uri, "member already mapped to another endpoint");
        }
        info!(uri = %local_uri, peers = backfill.len(), "peer discovery ready");
    }

    fn on_kernel_added(&self, member: MemberAddress, uri: &KernelUri) {
        let listeners = {
            let mut state = self.state.lock();
            if !state.ready || state.local_uri.as_ref() == Some(uri) {
                return;
            }
            if state.peers.insert(member, uri.clone()).as_ref() == Some(uri) {
                return;
            }
            self.listeners.snapshot()
        };
        info!(peer = %uri, %member, "peer discovered");
        let peer = uri.clone();
        self.executor.submit(move || {
            for listener in &listeners {
                listener.peer_discovered(&peer);
            }
            Ok(())
        });
    }

    fn on_kernel_removed(&self, member: &MemberAddress) {
        let (peer, listeners) = {
            let mut state = self.state.lock();
            if !state.ready {
                return;
            }
            match state.peers.remove(member) {
                Some(peer) => (peer, self.listeners.snapshot()),
                None => return,
            }
        };
        info!(peer = %peer, %member, "peer disconnected");
        self.executor.submit(move || {
            for listener in &listeners {
                listener.peer_disconnected(&peer);
            }
            Ok(())
        });
    }

    fn on_member_removed(&self, member: &MemberAddress) {
        if *member == self.membership.local_member() || !self.lifecycle.is_running() {
            return;
        }
        if let Some(uri) = self.kernels.remove(member) {
            debug!(%member, peer = %uri, "pruned kernel entry of departed member");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Collaborator adapters
// ────────────────────────────────────────────────────────────────────────────

struct Adapter(Weak<PeerDiscovery>);

impl EntryListener<MemberAddress, KernelUri> for Adapter {
    fn entry_added(&self, key: &MemberAddress, value: &KernelUri) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_kernel_added(*key, value);
        }
    }

    fn entry_removed(&self, key: &MemberAddress, _value: &KernelUri) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_kernel_removed(key);
        }
    }

    fn entry_updated(&self, key: &MemberAddress, value: &KernelUri) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_kernel_added(*key, value);
        }
    }
}

impl MembershipListener for Adapter {
    fn member_removed(&self, member: &MemberAddress) {
        if let Some(discovery) = self.0.upgrade() {
            discovery.on_member_removed(member);
        }
    }
}

impl NetworkStateListener for Adapter {
    fn running(&self, local_uri: &KernelUri) {
        if let Some(discovery) = self.0.upgrade() {
            if discovery.lifecycle.is_running() {
                discovery.network_ready(local_uri);
            }
        }
    }
}

#[async_trait]
impl KernelService for PeerDiscovery {
    fn name(&self) -> &str {
        "peer-discovery"
    }

    fn start_priority(&self) -> Option<u32> {
        Some(1)
    }

    fn stop_priority(&self) -> Option<u32> {
        Some(3)
    }

    fn state(&self) -> ServiceState {
        self.lifecycle.get()
    }

    async fn start(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }
        let listener = self.kernels.add_entry_listener(Arc::new(Adapter(self.this.clone())));
        let install_hooks = {
            let mut state = self.state.lock();
            state.map_listener = Some(listener);
            !std::mem::replace(&mut state.hooks_installed, true)
        };
        if install_hooks {
            self.membership
                .add_membership_listener(Arc::new(Adapter(self.this.clone())));
            self.network
                .add_state_listener(Arc::new(Adapter(self.this.clone())));
        }
        self.lifecycle.set(ServiceState::Running);
        info!(map = self.kernels.name(), member = %self.membership.local_member(), "peer discovery running");

        // The transport may have come up before this service.
        if let Some(uri) = self.network.local_uri() {
            self.network_ready(&uri);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgoraError> {
        if !self.lifecycle.begin_stop() {
            return Ok(());
        }
        let (listener, was_ready) = {
            let mut state = self.state.lock();
            let was_ready = state.ready;
            state.ready = false;
            state.peers.clear();
            (state.map_listener.take(), was_ready)
        };
        if let Some(listener) = listener {
            self.kernels.remove_entry_listener(listener);
        }
        if was_ready {
            self.kernels.remove(&self.membership.local_member());
        }
        self.lifecycle.set(ServiceState::Terminated);
        info!("peer discovery stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_middleware::{InMemoryCluster, InMemoryMembership, LoopbackNetwork, LoopbackTransport};
    use agora_middleware::DistributedDataProvider;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct Recorder {
        discovered: Mutex<Vec<KernelUri>>,
        disconnected: Mutex<Vec<KernelUri>>,
    }

    impl PeerListener for Recorder {
        fn peer_discovered(&self, peer: &KernelUri) {
            self.discovered.lock().push(peer.clone());
        }
        fn peer_disconnected(&self, peer: &KernelUri) {
            self.disconnected.lock().push(peer.clone());
        }
    }

    struct Node {
        member: Arc<InMemoryMembership>,
        transport: Arc<LoopbackTransport>,
        discovery: Arc<PeerDiscovery>,
        recorder: Arc<Recorder>,
    }

    async fn node(cluster: &Arc<InMemoryCluster>, hub: &Arc<LoopbackNetwork>) -> Result<Node, AgoraError> {
        let member = cluster.join();
        let transport = hub.transport(KernelUri::new("tcp", "127.0.0.1", None));
        let discovery = PeerDiscovery::new(
            cluster.kernel_map("agora"),
            member.clone(),
            transport.clone(),
            ExecutorService::new(Handle::current()),
        );
        let recorder = Arc::new(Recorder::default());
        discovery.add_peer_listener(recorder.clone());
        discovery.start().await?;
        Ok(Node {
            member,
            transport,
            discovery,
            recorder,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ready_backfills_existing_peers_and_announces_self() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let b = node(&cluster, &hub).await?;

        let a_uri = a.transport.bind()?;
        assert!(a.discovery.is_ready());
        assert!(a.recorder.discovered.lock().is_empty());

        let b_uri = b.transport.bind()?;
        // Backfill is synchronous.
        assert_eq!(*b.recorder.discovered.lock(), vec![a_uri.clone()]);
        settle().await;
        // a hears about b asynchronously, and nobody hears about itself.
        assert_eq!(*a.recorder.discovered.lock(), vec![b_uri.clone()]);
        assert_eq!(b.recorder.discovered.lock().len(), 1);
        assert_eq!(a.discovery.peers(), vec![b_uri]);

        let kernels = cluster.kernel_map("agora");
        assert_eq!(kernels.get(&a.member.local_member()), Some(a_uri));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_ready_signal_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let uri = a.transport.bind()?;
        a.discovery.network_ready(&KernelUri::new("tcp", "10.0.0.1", Some(9)));
        assert_eq!(a.discovery.local_uri(), Some(uri));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crashed_member_is_pruned_and_reported() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let b = node(&cluster, &hub).await?;
        a.transport.bind()?;
        let b_uri = b.transport.bind()?;
        settle().await;

        cluster.crash(&b.member.local_member());
        settle().await;

        assert!(!cluster.kernel_map("agora").contains_key(&b.member.local_member()));
        assert_eq!(*a.recorder.disconnected.lock(), vec![b_uri]);
        assert!(a.discovery.peers().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_withdraws_own_entry() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = node(&cluster, &hub).await?;
        let b = node(&cluster, &hub).await?;
        a.transport.bind()?;
        let b_uri = b.transport.bind()?;
        settle().await;

        b.discovery.stop().await?;
        settle().await;

        assert!(!cluster.kernel_map("agora").contains_key(&b.member.local_member()));
        assert_eq!(*a.recorder.disconnected.lock(), vec![b_uri]);
        assert!(!b.discovery.is_ready());
        assert_eq!(b.discovery.state(), ServiceState::Terminated);
        Ok(())
    }

    /// Counts subscriptions made through the wrapped collaborators.
    struct Subscriptions {
        member: Arc<InMemoryMembership>,
        transport: Arc<LoopbackTransport>,
        membership_listeners: Mutex<usize>,
        state_listeners: Mutex<usize>,
    }

    impl ClusterMembership for Subscriptions {
        fn local_member(&self) -> MemberAddress {
            self.member.local_member()
        }
        fn members(&self) -> Vec<MemberAddress> {
            self.member.members()
        }
        fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
            *self.membership_listeners.lock() += 1;
            self.member.add_membership_listener(listener);
        }
    }

    impl NetworkService for Subscriptions {
        fn publish(
            &self,
            space: &agora_types::SpaceId,
            scope: Arc<dyn agora_types::Scope>,
            event: &agora_types::Event,
        ) -> Result<(), agora_middleware::NetworkError> {
            self.transport.publish(space, scope, event)
        }
        fn connect_to_remote_space(
            &self,
            peer: &KernelUri,
            space: &agora_types::SpaceId,
            receiver: Arc<dyn agora_middleware::NetworkEventReceiver>,
        ) -> Result<(), agora_middleware::NetworkError> {
            self.transport.connect_to_remote_space(peer, space, receiver)
        }
        fn disconnect(&self, peer: &KernelUri) -> Result<(), agora_middleware::NetworkError> {
            self.transport.disconnect(peer)
        }
        fn disconnect_space(
            &self,
            peer: &KernelUri,
            space: &agora_types::SpaceId,
        ) -> Result<(), agora_middleware::NetworkError> {
            self.transport.disconnect_space(peer, space)
        }
        fn local_uri(&self) -> Option<KernelUri> {
            self.transport.local_uri()
        }
        fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>) {
            *self.state_listeners.lock() += 1;
            self.transport.add_state_listener(listener);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_subscribes_to_collaborators_once() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let subscriptions = Arc::new(Subscriptions {
            member: cluster.join(),
            transport: hub.transport(KernelUri::new("tcp", "127.0.0.1", None)),
            membership_listeners: Mutex::new(0),
            state_listeners: Mutex::new(0),
        });
        let discovery = PeerDiscovery::new(
            cluster.kernel_map("agora"),
            subscriptions.clone(),
            subscriptions.clone(),
            ExecutorService::new(Handle::current()),
        );

        for _ in 0..3 {
            discovery.start().await?;
            discovery.stop().await?;
        }
        assert_eq!(*subscriptions.membership_listeners.lock(), 1);
        assert_eq!(*subscriptions.state_listeners.lock(), 1);

        // The surviving adapters still drive a restarted service.
        discovery.start().await?;
        let uri = subscriptions.transport.bind()?;
        assert!(discovery.is_ready());
        assert_eq!(
            cluster.kernel_map("agora").get(&subscriptions.member.local_member()),
            Some(uri)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_bound_before_start_is_picked_up() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let member = cluster.join();
        let transport = hub.transport(KernelUri::new("tcp", "127.0.0.1", None));
        let uri = transport.bind()?;

        let discovery = PeerDiscovery::new(
            cluster.kernel_map("agora"),
            member.clone(),
            transport,
            ExecutorService::new(Handle::current()),
        );
        discovery.start().await?;
        assert!(discovery.is_ready());
        assert_eq!(cluster.kernel_map("agora").get(&member.local_member()), Some(uri));
        Ok(())
    }
}
