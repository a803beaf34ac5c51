//! The relay: the operations the HTTP layer calls.
//!
//! A [`Relay`] is created once at startup and cloned into every caller.
//! It owns the handle to the single registry task.

use crate::error::RelayError;
use crate::group::{GroupHandle, GroupSettings, Member};
use crate::id::{validate_group_id, MemberTag};
use crate::pump::{self, PumpTasks};
use crate::registry::{Registry, RegistryHandle};
use groupcast_transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of each member's outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of each group's join, leave and broadcast channels.
    pub inbox_capacity: usize,
    /// Deliver a member's own messages back to it.
    pub echo_to_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            inbox_capacity: 256,
            echo_to_sender: false,
        }
    }
}

/// A member that has joined a group.
#[derive(Debug)]
pub struct Joined {
    /// Tag attached to the member's messages.
    pub tag: MemberTag,
    /// The member's pump tasks.
    pub tasks: PumpTasks,
}

/// Relay statistics.
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Number of live groups.
    pub groups: usize,
    /// Messages dropped on full outbound queues since startup.
    pub dropped_messages: u64,
}

/// Entry point for creating, deleting and joining groups.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: RegistryHandle,
    config: RelayConfig,
    dropped: Arc<AtomicU64>,
}

impl Relay {
    /// Create a new relay with default configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a new relay with custom configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        let dropped = Arc::new(AtomicU64::new(0));
        let registry = Registry::spawn(GroupSettings {
            inbox_capacity: config.inbox_capacity,
            echo_to_sender: config.echo_to_sender,
            dropped: Arc::clone(&dropped),
        });

        Self {
            registry,
            config,
            dropped,
        }
    }

    /// Get the registry handle.
    #[must_use]
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Create a new, empty group.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or already taken.
    pub async fn create_group(&self, id: &str) -> Result<GroupHandle, RelayError> {
        validate_group_id(id).map_err(RelayError::InvalidId)?;
        self.registry.create(id).await
    }

    /// Delete a group, closing the stream of every member.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or no such group exists.
    pub async fn delete_group(&self, id: &str) -> Result<(), RelayError> {
        validate_group_id(id).map_err(RelayError::InvalidId)?;
        if self.registry.unregister(id).await? {
            Ok(())
        } else {
            Err(RelayError::NotFound(id.to_string()))
        }
    }

    /// Join the group `id` over `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or the group does not exist.
    pub async fn join_group<T: Transport>(
        &self,
        id: &str,
        transport: T,
    ) -> Result<Joined, RelayError> {
        validate_group_id(id).map_err(RelayError::InvalidId)?;
        let group = self
            .lookup(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        self.join(&group, transport).await
    }

    /// Join an already looked-up group.
    ///
    /// The pump loops are started only after the group has recorded the
    /// member, so a disconnect can never be processed before its join.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if the group closed in the meantime.
    pub async fn join<T: Transport>(
        &self,
        group: &GroupHandle,
        transport: T,
    ) -> Result<Joined, RelayError> {
        let (outbound, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let member = Member::new(outbound);
        let (key, tag) = (member.key, member.tag.clone());

        group.join(member).await?;
        debug!(group = %group.id(), member = %tag, "Joined");

        let tasks = pump::spawn(key, tag.clone(), group.clone(), transport, outbound_rx);
        Ok(Joined { tag, tasks })
    }

    /// Find a live group.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry has stopped.
    pub async fn lookup(&self, id: &str) -> Result<Option<GroupHandle>, RelayError> {
        self.registry.lookup(id).await
    }

    /// Get all live group ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry has stopped.
    pub async fn group_ids(&self) -> Result<Vec<String>, RelayError> {
        let mut ids = self.registry.group_ids().await?;
        ids.sort();
        Ok(ids)
    }

    /// Get relay statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry has stopped.
    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        Ok(RelayStats {
            groups: self.registry.len().await?,
            dropped_messages: self.dropped.load(Ordering::Relaxed),
        })
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupcast_transport::{close_code, MemoryPeer, MemoryTransport};
    use std::future::Future;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    async fn within<F: Future>(future: F) -> F::Output {
        timeout(WAIT, future).await.expect("timed out")
    }

    async fn connect(relay: &Relay, id: &str) -> (Joined, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let joined = relay.join_group(id, transport).await.unwrap();
        (joined, peer)
    }

    async fn wait_until_gone(relay: &Relay, id: &str) {
        within(async {
            while relay.lookup(id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_lobby_fan_out() {
        let relay = Relay::new();
        relay.create_group("lobby").await.unwrap();

        let (a, mut a_peer) = connect(&relay, "lobby").await;
        let (b, mut b_peer) = connect(&relay, "lobby").await;
        let (_c, mut c_peer) = connect(&relay, "lobby").await;

        assert!(a_peer.send("hi").await);
        let expected = format!("{} - hi", a.tag);
        assert_eq!(within(b_peer.recv()).await.unwrap(), expected);
        assert_eq!(within(c_peer.recv()).await.unwrap(), expected);

        // B answers only after seeing A's message, so if A had been sent its
        // own message it would arrive first.
        assert!(b_peer.send("hello").await);
        let reply = within(a_peer.recv()).await.unwrap();
        assert_eq!(reply, format!("{} - hello", b.tag));
        assert_eq!(within(c_peer.recv()).await.unwrap(), reply);
        assert!(b_peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_echo_to_sender_when_enabled() {
        let relay = Relay::with_config(RelayConfig {
            echo_to_sender: true,
            ..RelayConfig::default()
        });
        relay.create_group("echo").await.unwrap();
        let (a, mut a_peer) = connect(&relay, "echo").await;
        let (_b, mut b_peer) = connect(&relay, "echo").await;

        assert!(a_peer.send("ping").await);
        let expected = format!("{} - ping", a.tag);
        assert_eq!(within(a_peer.recv()).await.unwrap(), expected);
        assert_eq!(within(b_peer.recv()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_messages_keep_broadcast_order() {
        let relay = Relay::new();
        relay.create_group("ordered").await.unwrap();
        let (a, a_peer) = connect(&relay, "ordered").await;
        let (_b, mut b_peer) = connect(&relay, "ordered").await;

        for i in 0..50 {
            assert!(a_peer.send(format!("{i}")).await);
        }
        for i in 0..50 {
            let frame = within(b_peer.recv()).await.unwrap();
            assert_eq!(frame, format!("{} - {i}", a.tag));
        }
    }

    #[tokio::test]
    async fn test_delete_closes_every_member() {
        let relay = Relay::new();
        relay.create_group("lobby").await.unwrap();
        let mut members = Vec::new();
        for _ in 0..3 {
            members.push(connect(&relay, "lobby").await);
        }

        relay.delete_group("lobby").await.unwrap();

        for (joined, mut peer) in members {
            assert_eq!(within(peer.recv()).await, None);
            peer.close(Some(close_code::NORMAL)).await;
            within(joined.tasks.wait()).await;
        }
        assert!(relay.lookup("lobby").await.unwrap().is_none());
        assert!(matches!(
            relay.delete_group("lobby").await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_delete_reports_one_success() {
        let relay = Relay::new();
        relay.create_group("twice").await.unwrap();
        let (_joined, mut peer) = connect(&relay, "twice").await;

        let (first, second) = tokio::join!(relay.delete_group("twice"), relay.delete_group("twice"));
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(within(peer.recv()).await, None);
    }

    #[tokio::test]
    async fn test_last_leave_removes_group() {
        let relay = Relay::new();
        relay.create_group("x").await.unwrap();
        let (joined, peer) = connect(&relay, "x").await;

        peer.close(Some(close_code::GOING_AWAY)).await;
        within(joined.tasks.wait()).await;
        wait_until_gone(&relay, "x").await;

        let (transport, _peer) = MemoryTransport::pair();
        assert!(matches!(
            relay.join_group("x", transport).await,
            Err(RelayError::NotFound(_))
        ));

        // Re-created, it can be joined again.
        relay.create_group("x").await.unwrap();
        let (_joined, _peer) = connect(&relay, "x").await;
    }

    #[tokio::test]
    async fn test_fresh_group_waits_for_members() {
        let relay = Relay::new();
        relay.create_group("quiet").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let group = relay.lookup("quiet").await.unwrap().unwrap();
        assert!(!group.is_closed());
        let (_joined, _peer) = connect(&relay, "quiet").await;
    }

    #[tokio::test]
    async fn test_create_conflict_and_invalid_ids() {
        let relay = Relay::new();
        relay.create_group("dup").await.unwrap();

        assert!(matches!(
            relay.create_group("dup").await,
            Err(RelayError::AlreadyExists(_))
        ));
        assert!(matches!(
            relay.create_group("").await,
            Err(RelayError::InvalidId(_))
        ));
        let (transport, _peer) = MemoryTransport::pair();
        assert!(matches!(
            relay.join_group("nowhere", transport).await,
            Err(RelayError::NotFound(_))
        ));
        assert_eq!(relay.group_ids().await.unwrap(), vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn test_unicode_group_ids() {
        let relay = Relay::new();
        for id in ["café", "日本", "my room", "$room"] {
            relay.create_group(id).await.unwrap();
        }

        let (a, a_peer) = connect(&relay, "café").await;
        let (_b, mut b_peer) = connect(&relay, "café").await;
        assert!(a_peer.send("salut").await);
        assert_eq!(
            within(b_peer.recv()).await.unwrap(),
            format!("{} - salut", a.tag)
        );

        assert!(matches!(
            relay.create_group("line\nbreak").await,
            Err(RelayError::InvalidId(_))
        ));
        assert_eq!(relay.stats().await.unwrap().groups, 4);
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_block_group() {
        let relay = Relay::with_config(RelayConfig {
            outbound_capacity: 4,
            ..RelayConfig::default()
        });
        relay.create_group("busy").await.unwrap();
        let (_a, a_peer) = connect(&relay, "busy").await;

        // This peer never reads; its socket holds one frame.
        let (stalled, _stalled_peer) = MemoryTransport::with_capacity(1);
        let _stalled = relay.join_group("busy", stalled).await.unwrap();

        for i in 0..20 {
            assert!(a_peer.send(format!("{i}")).await);
        }

        within(async {
            while relay.stats().await.unwrap().dropped_messages < 14 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        // The loop still serves joins and broadcasts.
        let (_late, mut late_peer) = connect(&relay, "busy").await;
        assert!(a_peer.send("after").await);
        within(async {
            while let Some(frame) = late_peer.recv().await {
                if frame.ends_with(" - after") {
                    return;
                }
            }
            panic!("stream closed before the last message");
        })
        .await;
    }

    #[tokio::test]
    async fn test_stats_count_groups() {
        let relay = Relay::new();
        relay.create_group("one").await.unwrap();
        relay.create_group("two").await.unwrap();

        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.groups, 2);
        assert_eq!(stats.dropped_messages, 0);
    }
}
