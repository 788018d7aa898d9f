//! Cluster membership contract.
//!
//! The membership layer is the transport-level view of which processes are
//! part of the cluster.  The kernel only uses it to prune stale peer-registry
//! entries when a member disappears without cleaning up after itself.

use std::sync::Arc;

use agora_types::MemberAddress;

/// Observer of membership changes.
pub trait MembershipListener: Send + Sync {
    fn member_added(&self, _member: &MemberAddress) {}
    fn member_removed(&self, _member: &MemberAddress) {}
}

/// Read access to cluster membership plus change notifications.
pub trait ClusterMembership: Send + Sync {
    /// Membership address of the local process.
    fn local_member(&self) -> MemberAddress;

    /// Snapshot of the current members, the local one included.
    fn members(&self) -> Vec<MemberAddress>;

    fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>);
}
