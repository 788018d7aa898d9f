//! `agora-kernel` – Directory & Event Routing Core
//!
//! The part of a kernel that keeps contexts and spaces consistent across the
//! cluster and moves events between participants, locally and to peers.
//!
//! # Modules
//!
//! - [`service`] – [`KernelService`]: the start/stop contract with optional
//!   start and stop priorities.
//! - [`orchestrator`] – [`ServiceManager`]: starts prioritized services one
//!   by one, then the rest concurrently; stops them in mirrored order.
//! - [`discovery`] – [`PeerDiscovery`]: publishes the local endpoint once the
//!   transport is ready and tracks live peers through the replicated kernel
//!   map.
//! - [`directory`] – [`DirectoryService`]: materializes local
//!   [`Context`][directory::Context] mirrors of the replicated directory map,
//!   each owning a [`SpaceRepository`][directory::SpaceRepository].
//! - [`registry`] – [`UniqueAddressRegistry`] and [`MultiAddressRegistry`]:
//!   per-space participant bindings.
//! - [`space`] – [`EventSpace`]: scoped fan-out of events to local
//!   participants and to the network.
//! - [`bridge`] – [`NetworkBridge`]: subscribes local spaces to their
//!   counterparts on every peer.
//!
//! # Start order
//!
//! | Service | Start priority | Stop priority |
//! |---|---|---|
//! | [`PeerDiscovery`] | 1 | 3 |
//! | [`DirectoryService`] | 2 | 2 |
//! | [`NetworkBridge`] | 3 | 1 |

mod listeners;

pub mod bridge;
pub mod directory;
pub mod discovery;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod space;

pub use bridge::NetworkBridge;
pub use directory::{
    Context, ContextRepositoryListener, DirectoryService, SpaceRepository, SpaceRepositoryListener,
};
pub use discovery::{PeerDiscovery, PeerListener};
pub use orchestrator::ServiceManager;
pub use registry::{
    MultiAddressRegistry, Participant, ParticipantListener, ParticipantRegistry, RegistryKind,
    UniqueAddressRegistry,
};
pub use service::{KernelService, Lifecycle, ServiceState};
pub use space::{EventSpace, SpaceEnvironment};
