//! Network transport contract.
//!
//! The kernel never talks to sockets.  It hands `(space, scope, event)`
//! triples to a [`NetworkService`] and receives inbound events through a
//! [`NetworkEventReceiver`] registered per remote space.  The concrete wire
//! format and transport belong to the implementation.

use std::sync::Arc;

use agora_types::{AgoraError, Event, KernelUri, Scope, SpaceId};
use thiserror::Error;

/// Failures raised by a [`NetworkService`].
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("network transport is not ready")]
    NotReady,

    #[error("unknown peer: {0}")]
    UnknownPeer(KernelUri),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<NetworkError> for AgoraError {
    fn from(e: NetworkError) -> Self {
        AgoraError::Network(e.to_string())
    }
}

/// Sink for events that arrive from a remote kernel.
pub trait NetworkEventReceiver: Send + Sync {
    fn receive_remote(&self, space: &SpaceId, scope: Arc<dyn Scope>, event: Event);
}

/// Observer of the transport lifecycle.
pub trait NetworkStateListener: Send + Sync {
    /// The transport is ready and reachable at `local_uri`.
    fn running(&self, local_uri: &KernelUri);

    fn stopped(&self) {}
}

/// Publish/receive primitives offered by the network layer.
pub trait NetworkService: Send + Sync {
    /// Send `event` to every kernel connected to `space` on this kernel.
    fn publish(&self, space: &SpaceId, scope: Arc<dyn Scope>, event: &Event) -> Result<(), NetworkError>;

    /// Start receiving the events `peer` publishes into `space`.
    fn connect_to_remote_space(
        &self,
        peer: &KernelUri,
        space: &SpaceId,
        receiver: Arc<dyn NetworkEventReceiver>,
    ) -> Result<(), NetworkError>;

    /// Drop every space connection to `peer`.
    fn disconnect(&self, peer: &KernelUri) -> Result<(), NetworkError>;

    /// Drop the connection to `peer` for one `space`.
    fn disconnect_space(&self, peer: &KernelUri, space: &SpaceId) -> Result<(), NetworkError>;

    /// Public endpoint of this kernel, known once the transport is running.
    fn local_uri(&self) -> Option<KernelUri>;

    fn add_state_listener(&self, listener: Arc<dyn NetworkStateListener>);
}

/// Bring-up half of a transport, driven by the kernel that owns it.
pub trait NetworkTransport: NetworkService {
    /// Bind the local endpoint and fire `running` on the state listeners.
    fn bind(&self) -> Result<KernelUri, NetworkError>;

    /// Release the endpoint and fire `stopped`.
    fn shutdown(&self);
}
