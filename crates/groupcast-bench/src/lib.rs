//! Shared fixtures for the groupcast benchmarks.

use groupcast_core::{Joined, Relay};
use groupcast_transport::{MemoryPeer, MemoryTransport};

/// Create `group` on `relay` and join `members` in-memory participants.
///
/// # Panics
///
/// Panics if the group cannot be created or joined.
pub async fn populate(relay: &Relay, group: &str, members: usize) -> Vec<(Joined, MemoryPeer)> {
    relay.create_group(group).await.expect("create group");

    let mut joined = Vec::with_capacity(members);
    for _ in 0..members {
        let (transport, peer) = MemoryTransport::pair();
        let member = relay
            .join_group(group, transport)
            .await
            .expect("join group");
        joined.push((member, peer));
    }
    joined
}
