//! [`Kernel`] – one fully wired kernel process.
//!
//! A kernel owns the three orchestrated services of `agora-kernel` plus the
//! transport it binds once they are running:
//!
//! 1. [`ServiceManager::start_all`] (discovery, directory, bridge).
//! 2. [`NetworkTransport::bind`], which signals transport readiness to
//!    discovery.
//! 3. The configured root context is created (or joined, when another kernel
//!    already published it).
//!
//! [`Kernel::stop`] runs the orchestrated stop and then shuts the transport
//! down.  Participants can only [`join`][Kernel::join] while the kernel is
//! running.
//!
//! # Example
//!
//! ```rust,no_run
//! use agora_middleware::{InMemoryCluster, LoopbackNetwork};
//! use agora_runtime::{Kernel, KernelConfig};
//!
//! # async fn boot() -> Result<(), agora_types::AgoraError> {
//! let cluster = InMemoryCluster::new();
//! let hub = LoopbackNetwork::new();
//! let kernel = Kernel::in_memory(KernelConfig::default(), &cluster, &hub)?;
//! let uri = kernel.start().await?;
//! println!("kernel listening on {uri}");
//! kernel.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agora_kernel::{
    Context, DirectoryService, KernelService, NetworkBridge, Participant, PeerDiscovery, ServiceManager,
    SpaceEnvironment,
};
use agora_middleware::{
    ClusterMembership, DistributedDataProvider, ExecutorService, InMemoryCluster, LoopbackNetwork,
    NetworkService, NetworkTransport, UncaughtErrorHandler,
};
use agora_types::{Address, AgoraError, ContextId, KernelUri, MemberAddress};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::KernelConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles a [`Kernel`] from its external collaborators.
///
/// The data provider, the membership handle and the transport are required.
/// The runtime handle defaults to the current Tokio runtime and the error
/// handler to [`LoggingErrorHandler`][agora_middleware::LoggingErrorHandler].
pub struct KernelBuilder {
    config: KernelConfig,
    data: Option<Arc<dyn DistributedDataProvider>>,
    membership: Option<Arc<dyn ClusterMembership>>,
    transport: Option<(Arc<dyn NetworkTransport>, Arc<dyn NetworkService>)>,
    error_handler: Option<Arc<dyn UncaughtErrorHandler>>,
    handle: Option<Handle>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            data: None,
            membership: None,
            transport: None,
            error_handler: None,
            handle: None,
        }
    }

    pub fn data_provider(mut self, data: Arc<dyn DistributedDataProvider>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn membership(mut self, membership: Arc<dyn ClusterMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn transport<T: NetworkTransport + 'static>(mut self, transport: Arc<T>) -> Self {
        let network: Arc<dyn NetworkService> = transport.clone();
        let transport: Arc<dyn NetworkTransport> = transport;
        self.transport = Some((transport, network));
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn UncaughtErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Kernel, AgoraError> {
        let data = self.data.ok_or_else(|| missing("distributed data provider"))?;
        let membership = self.membership.ok_or_else(|| missing("cluster membership"))?;
        let (transport, network) = self.transport.ok_or_else(|| missing("network transport"))?;
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|e| AgoraError::Config(format!("Kernel needs a Tokio runtime: {e}")))?,
        };
        let executor = match self.error_handler {
            Some(handler) => ExecutorService::with_error_handler(handle, handler),
            None => ExecutorService::new(handle),
        };

        let config = self.config;
        let member = membership.local_member();
        let discovery = PeerDiscovery::new(
            data.kernel_map(&config.cluster_id),
            membership,
            Arc::clone(&network),
            executor.clone(),
        );
        let directory = DirectoryService::new(
            data.context_map(&config.cluster_id),
            SpaceEnvironment {
                executor: executor.clone(),
                network: Arc::clone(&network),
                registry_kind: config.registry,
            },
        );
        let bridge = NetworkBridge::new(Arc::clone(&directory), Arc::clone(&discovery), network);
        let manager = ServiceManager::new(vec![
            Arc::clone(&discovery) as Arc<dyn KernelService>,
            Arc::clone(&directory) as Arc<dyn KernelService>,
            Arc::clone(&bridge) as Arc<dyn KernelService>,
        ])
        .with_startup_timeout(config.startup_timeout());

        info!(member = %member, cluster = %config.cluster_id, registry = %config.registry, "kernel assembled");
        Ok(Kernel {
            config,
            member,
            executor,
            discovery,
            directory,
            bridge,
            manager,
            transport,
            running: AtomicBool::new(false),
        })
    }
}

fn missing(what: &str) -> AgoraError {
    AgoraError::Config(format!("Kernel builder is missing a {what}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

pub struct Kernel {
    config: KernelConfig,
    member: MemberAddress,
    executor: ExecutorService,
    discovery: Arc<PeerDiscovery>,
    directory: Arc<DirectoryService>,
    bridge: Arc<NetworkBridge>,
    manager: ServiceManager,
    transport: Arc<dyn NetworkTransport>,
    running: AtomicBool,
}

impl Kernel {
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    /// A kernel that joins `cluster` as a new member and binds a loopback
    /// transport on `hub` at the configured URI.
    pub fn in_memory(
        config: KernelConfig,
        cluster: &Arc<InMemoryCluster>,
        hub: &Arc<LoopbackNetwork>,
    ) -> Result<Self, AgoraError> {
        let transport = hub.transport(config.kernel_uri()?);
        KernelBuilder::new(config)
            .data_provider(Arc::clone(cluster) as Arc<dyn DistributedDataProvider>)
            .membership(cluster.join())
            .transport(transport)
            .build()
    }

    /// Start the services, bind the transport and create the root context.
    ///
    /// Returns the bound endpoint.  On failure every service that already
    /// started is stopped again.
    pub async fn start(&self) -> Result<KernelUri, AgoraError> {
        info!(member = %self.member, "kernel starting");
        if let Err(e) = self.manager.start_all().await {
            error!(member = %self.member, error = %e, "kernel boot failed");
            if let Err(stop) = self.manager.stop_all().await {
                warn!(error = %stop, "cleanup after failed boot reported an error");
            }
            return Err(e);
        }

        let uri = match self.transport.bind() {
            Ok(uri) => uri,
            Err(e) => {
                error!(member = %self.member, error = %e, "transport bind failed");
                if let Err(stop) = self.manager.stop_all().await {
                    warn!(error = %stop, "cleanup after failed bind reported an error");
                }
                return Err(e.into());
            }
        };

        let root = self
            .directory
            .create_context(self.config.root_context_id, self.config.root_space_id);
        self.running.store(true, Ordering::SeqCst);
        info!(uri = %uri, root = %root.id(), "kernel running");
        Ok(uri)
    }

    /// Stop the services in reverse dependency order, then release the
    /// transport.  The first stop failure is returned after everything has
    /// been attempted.
    pub async fn stop(&self) -> Result<(), AgoraError> {
        self.running.store(false, Ordering::SeqCst);
        info!(member = %self.member, "kernel stopping");
        let result = self.manager.stop_all().await;
        self.transport.shutdown();
        info!(member = %self.member, "kernel stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn create_context(&self, id: ContextId, default_space_id: Uuid) -> Arc<Context> {
        self.directory.create_context(id, default_space_id)
    }

    pub fn remove_context(&self, id: &ContextId) -> bool {
        self.directory.remove_context(id)
    }

    pub fn context(&self, id: &ContextId) -> Option<Arc<Context>> {
        self.directory.context(id)
    }

    pub fn root_context(&self) -> Option<Arc<Context>> {
        self.directory.context(&self.config.root_context_id)
    }

    /// Register `participant` in the default space of `context`.
    pub fn join(&self, context: &ContextId, participant: Arc<dyn Participant>) -> Result<Address, AgoraError> {
        if !self.is_running() {
            return Err(AgoraError::SpawnDisabled(format!(
                "kernel {} is not running",
                self.member
            )));
        }
        let ctx = self
            .directory
            .context(context)
            .ok_or(AgoraError::UnknownContext(*context))?;
        let space = ctx
            .default_space()
            .ok_or(AgoraError::DefaultSpaceMissing(*context))?;
        let address = space.register(participant);
        info!(context = %context, participant = %address.participant, "participant joined");
        Ok(address)
    }

    /// Unregister `participant` from every space of `context`.
    pub fn kill_participant(&self, context: &ContextId, participant: Uuid) -> Result<Vec<Address>, AgoraError> {
        let ctx = self
            .directory
            .context(context)
            .ok_or(AgoraError::UnknownContext(*context))?;
        let removed: Vec<Address> = ctx
            .spaces()
            .spaces()
            .iter()
            .flat_map(|space| space.unregister(participant))
            .collect();
        if removed.is_empty() {
            return Err(AgoraError::ParticipantNotFound {
                participant,
                context: *context,
            });
        }
        info!(context = %context, participant = %participant, addresses = removed.len(), "participant killed");
        Ok(removed)
    }

    pub fn peers(&self) -> Vec<KernelUri> {
        self.discovery.peers()
    }

    pub fn local_uri(&self) -> Option<KernelUri> {
        self.transport.local_uri()
    }

    pub fn member(&self) -> MemberAddress {
        self.member
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn executor(&self) -> &ExecutorService {
        &self.executor
    }

    pub fn directory(&self) -> &Arc<DirectoryService> {
        &self.directory
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    pub fn bridge(&self) -> &Arc<NetworkBridge> {
        &self.bridge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_kernel::ServiceState;
    use agora_types::{Event, TaskError};
    use parking_lot::Mutex;

    struct Inbox {
        id: Uuid,
        events: Mutex<Vec<Event>>,
    }

    impl Inbox {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                events: Mutex::new(Vec::new()),
            })
        }
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

    #[tokio::test]
    async fn builder_rejects_missing_collaborators() {
        let cluster = InMemoryCluster::new();
        let result = KernelBuilder::new(KernelConfig::default())
            .data_provider(cluster as Arc<dyn DistributedDataProvider>)
            .build();
        assert!(matches!(result, Err(AgoraError::Config(_))));
    }

    #[test]
    fn builder_outside_a_runtime_needs_a_handle() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let result = Kernel::in_memory(KernelConfig::default(), &cluster, &hub);
        assert!(matches!(result, Err(AgoraError::Config(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_binds_and_creates_root_context() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let kernel = Kernel::in_memory(KernelConfig::default(), &cluster, &hub)?;
        assert!(kernel.local_uri().is_none());

        let uri = kernel.start().await?;
        assert!(!uri.is_wildcard());
        assert_eq!(kernel.local_uri(), Some(uri));
        assert!(kernel.is_running());
        assert!(kernel.discovery().is_ready());
        assert_eq!(kernel.bridge().state(), ServiceState::Running);

        let root = kernel.root_context().ok_or("root context missing")?;
        assert_eq!(root.default_space_id(), kernel.config().root_space_id);

        kernel.stop().await?;
        assert!(!kernel.is_running());
        assert!(kernel.local_uri().is_none());
        assert!(kernel.root_context().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_requires_a_running_kernel() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let kernel = Kernel::in_memory(KernelConfig::default(), &cluster, &hub)?;
        let root = kernel.config().root_context_id;

        let early = kernel.join(&root, Inbox::new());
        assert!(matches!(early, Err(AgoraError::SpawnDisabled(_))));

        kernel.start().await?;
        let address = kernel.join(&root, Inbox::new())?;
        assert_eq!(address.space.context_id, root);

        let unknown = Uuid::new_v4();
        assert!(matches!(
            kernel.join(&unknown, Inbox::new()),
            Err(AgoraError::UnknownContext(id)) if id == unknown
        ));

        kernel.stop().await?;
        assert!(matches!(kernel.join(&root, Inbox::new()), Err(AgoraError::SpawnDisabled(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_participant_clears_every_space() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let kernel = Kernel::in_memory(KernelConfig::default(), &cluster, &hub)?;
        kernel.start().await?;

        let context = kernel.create_context(Uuid::new_v4(), Uuid::new_v4());
        let inbox = Inbox::new();
        kernel.join(&context.id(), inbox.clone())?;
        let extra = context
            .spaces()
            .get_or_create_space(Uuid::new_v4(), agora_types::EVENT_SPACE_SPEC)?;
        extra.register(inbox.clone());

        let removed = kernel.kill_participant(&context.id(), inbox.id)?;
        assert_eq!(removed.len(), 2);
        assert!(context.spaces().spaces().iter().all(|s| s.addresses_of(inbox.id).is_empty()));

        let again = kernel.kill_participant(&context.id(), inbox.id);
        assert!(matches!(again, Err(AgoraError::ParticipantNotFound { .. })));

        kernel.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_kernel_adopts_existing_root_context() -> Result<(), Box<dyn std::error::Error>> {
        let cluster = InMemoryCluster::new();
        let hub = LoopbackNetwork::new();
        let a = Kernel::in_memory(KernelConfig::default(), &cluster, &hub)?;
        a.start().await?;

        let config = KernelConfig {
            root_space_id: Uuid::new_v4(),
            ..KernelConfig::default()
        };
        let b = Kernel::in_memory(config, &cluster, &hub)?;
        b.start().await?;

        let on_b = b.root_context().ok_or("root context missing on b")?;
        assert_eq!(on_b.default_space_id(), a.config().root_space_id);

        b.stop().await?;
        a.stop().await?;
        Ok(())
    }
}
