//! Single-process cluster.
//!
//! [`InMemoryCluster`] plays the role of the replicated data grid for kernels
//! that share one process: it owns the named maps handed out through
//! [`DistributedDataProvider`] and the membership list exposed to each kernel
//! through [`InMemoryMembership`].
//!
//! Departures come in two flavours:
//!
//! * [`InMemoryCluster::leave`] – graceful: the member's entries in every
//!   kernel map are removed, then `member_removed` fires.
//! * [`InMemoryCluster::crash`] – abrupt: only `member_removed` fires and the
//!   stale kernel-map entry stays behind for the survivors to prune.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use agora_types::{ContextId, KernelUri, MemberAddress};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::map::{
    DistributedDataProvider, DistributedMap, InMemoryMap, context_map_name, kernel_map_name,
};
use crate::membership::{ClusterMembership, MembershipListener};

/// Membership port of the first member, mirroring common data-grid defaults.
const FIRST_MEMBER_PORT: u16 = 5701;

struct ClusterState {
    context_maps: HashMap<String, Arc<InMemoryMap<ContextId, Uuid>>>,
    kernel_maps: HashMap<String, Arc<InMemoryMap<MemberAddress, KernelUri>>>,
    members: Vec<Arc<InMemoryMembership>>,
    next_port: u16,
}

/// Shared data grid and membership list for in-process kernels.
pub struct InMemoryCluster {
    this: Weak<InMemoryCluster>,
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(ClusterState {
                context_maps: HashMap::new(),
                kernel_maps: HashMap::new(),
                members: Vec::new(),
                next_port: FIRST_MEMBER_PORT,
            }),
        })
    }

    /// Add a member and notify the existing ones.
    pub fn join(&self) -> Arc<InMemoryMembership> {
        let (member, existing) = {
            let mut state = self.state.lock();
            let address = loop {
                let candidate = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), state.next_port);
                state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_MEMBER_PORT);
                if !state.members.iter().any(|m| m.local == candidate) {
                    break candidate;
                }
            };
            let member = Arc::new(InMemoryMembership {
                cluster: self.this.clone(),
                local: address,
                listeners: Mutex::new(Vec::new()),
            });
            let existing = state.members.clone();
            state.members.push(Arc::clone(&member));
            (member, existing)
        };
        info!(member = %member.local, "member joined");
        for other in existing {
            other.fire(|l| l.member_added(&member.local));
        }
        member
    }

    /// Graceful departure: drop the member's kernel-map entries, then notify.
    pub fn leave(&self, member: &MemberAddress) {
        let kernel_maps: Vec<_> = self.state.lock().kernel_maps.values().cloned().collect();
        for map in kernel_maps {
            map.remove(member);
        }
        self.depart(member);
    }

    /// Abrupt departure: notify only, leaving stale entries in place.
    pub fn crash(&self, member: &MemberAddress) {
        self.depart(member);
    }

    /// Snapshot of every current member address.
    pub fn member_addresses(&self) -> Vec<MemberAddress> {
        self.state.lock().members.iter().map(|m| m.local).collect()
    }

    fn depart(&self, member: &MemberAddress) {
        let remaining = {
            let mut state = self.state.lock();
            let before = state.members.len();
            state.members.retain(|m| &m.local != member);
            if state.members.len() == before {
                return;
            }
            state.members.clone()
        };
        info!(member = %member, "member left");
        for other in remaining {
            other.fire(|l| l.member_removed(member));
        }
    }
}

impl DistributedDataProvider for InMemoryCluster {
    fn context_map(&self, cluster_id: &str) -> Arc<dyn DistributedMap<ContextId, Uuid>> {
        let name = context_map_name(cluster_id);
        let mut state = self.state.lock();
        let map = state
            .context_maps
            .entry(name.clone())
            .or_insert_with(|| Arc::new(InMemoryMap::new(name)));
        Arc::clone(map) as Arc<dyn DistributedMap<ContextId, Uuid>>
    }

    fn kernel_map(&self, cluster_id: &str) -> Arc<dyn DistributedMap<MemberAddress, KernelUri>> {
        let name = kernel_map_name(cluster_id);
        let mut state = self.state.lock();
        let map = state
            .kernel_maps
            .entry(name.clone())
            .or_insert_with(|| Arc::new(InMemoryMap::new(name)));
        Arc::clone(map) as Arc<dyn DistributedMap<MemberAddress, KernelUri>>
    }
}

/// One member's view of an [`InMemoryCluster`].
pub struct InMemoryMembership {
    cluster: Weak<InMemoryCluster>,
    local: MemberAddress,
    listeners: Mutex<Vec<Arc<dyn MembershipListener>>>,
}

impl InMemoryMembership {
    fn fire(&self, f: impl Fn(&dyn MembershipListener)) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }
}

impl ClusterMembership for InMemoryMembership {
    fn local_member(&self) -> MemberAddress {
        self.local
    }

    fn members(&self) -> Vec<MemberAddress> {
        self.cluster
            .upgrade()
            .map(|c| c.member_addresses())
            .unwrap_or_default()
    }

    fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.lock().push(listener);
    }
}
