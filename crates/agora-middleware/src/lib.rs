//! `agora-middleware` – The Collaborator Seams
//!
//! Everything the kernel consumes but does not own: the replicated maps,
//! cluster membership, the network transport and the shared executor.  The
//! kernel only sees the traits; the in-memory implementations let several
//! kernels share one process.
//!
//! # Modules
//!
//! - [`map`] – [`DistributedMap`] and [`EntryListener`], plus the
//!   process-local [`InMemoryMap`].
//! - [`membership`] – [`ClusterMembership`] and [`MembershipListener`].
//! - [`network`] – [`NetworkService`], [`NetworkTransport`],
//!   [`NetworkEventReceiver`] and [`NetworkStateListener`].
//! - [`executor`] – [`ExecutorService`]: Tokio-backed task execution with
//!   tagged outcomes and a silent cancellation sentinel.
//! - [`cluster`] – [`InMemoryCluster`]: shared maps and membership for
//!   in-process kernels.
//! - [`loopback`] – [`LoopbackNetwork`]: in-process transport hub.

pub mod cluster;
pub mod executor;
pub mod loopback;
pub mod map;
pub mod membership;
pub mod network;

pub use cluster::{InMemoryCluster, InMemoryMembership};
pub use executor::{
    ExecutorService, LoggingErrorHandler, ScheduledTask, TaskHandle, TaskId, TaskListener,
    TaskOutcome, UncaughtErrorHandler,
};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use map::{DistributedDataProvider, DistributedMap, EntryListener, InMemoryMap, ListenerId};
pub use membership::{ClusterMembership, MembershipListener};
pub use network::{
    NetworkError, NetworkEventReceiver, NetworkService, NetworkStateListener, NetworkTransport,
};
