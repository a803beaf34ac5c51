//! Groups: named rooms with a single control loop.
//!
//! Each group runs one task that owns its membership map. Joins, leaves and
//! broadcasts arrive on three channels and are applied one at a time, so the
//! map is never touched from outside the loop. A fourth, one-shot signal held
//! by the registry closes the broadcast path when the group is deleted.
//!
//! ```text
//!  Idle ──join──▶ Running ──last leave──▶ Terminated
//!   │                │                        ▲
//!   └─────close──────┴──close──▶ Draining ────┘
//! ```

use crate::error::RelayError;
use crate::id::{GroupInstance, MemberKey, MemberTag};
use crate::message::Envelope;
use crate::registry::RegistryCommand;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Settings shared by every group a registry creates.
#[derive(Debug, Clone)]
pub(crate) struct GroupSettings {
    /// Capacity of each control channel.
    pub inbox_capacity: usize,
    /// Deliver a member's own messages back to it.
    pub echo_to_sender: bool,
    /// Relay-wide count of messages dropped on full outbound queues.
    pub dropped: Arc<AtomicU64>,
}

/// Lifecycle of a group's control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupState {
    /// Created, waiting for its first member. Never self-terminates.
    Idle,
    /// Has had at least one member.
    Running,
    /// Broadcast path closed; closing every member queue.
    Draining,
    /// Loop exited.
    Terminated,
}

/// A group's record of one connected member.
///
/// The group holds the only sender of the member's outbound queue, so
/// dropping the record is what closes the queue.
#[derive(Debug)]
pub(crate) struct Member {
    pub key: MemberKey,
    pub tag: MemberTag,
    outbound: mpsc::Sender<Arc<Envelope>>,
    dropped: u64,
}

impl Member {
    pub fn new(outbound: mpsc::Sender<Arc<Envelope>>) -> Self {
        Self {
            key: MemberKey::next(),
            tag: MemberTag::generate(),
            outbound,
            dropped: 0,
        }
    }
}

pub(crate) struct JoinRequest {
    member: Member,
    ack: oneshot::Sender<()>,
}

impl std::fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRequest")
            .field("member", &self.member.key)
            .finish()
    }
}

/// Handle to a live group.
///
/// Cloning is cheap. Every operation fails fast once the group's loop has
/// exited, which callers treat as the group being gone.
#[derive(Debug, Clone)]
pub struct GroupHandle {
    id: Arc<str>,
    instance: GroupInstance,
    join_tx: mpsc::Sender<JoinRequest>,
    leave_tx: mpsc::Sender<MemberKey>,
    broadcast_tx: mpsc::Sender<Arc<Envelope>>,
}

impl GroupHandle {
    /// Get the group identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the instance number of this group.
    #[must_use]
    pub fn instance(&self) -> GroupInstance {
        self.instance
    }

    /// Whether the group's loop has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.broadcast_tx.is_closed()
    }

    /// Submit a message for fan-out.
    ///
    /// Returns `false` if the broadcast path is closed.
    pub async fn broadcast(&self, envelope: Envelope) -> bool {
        self.broadcast_tx.send(Arc::new(envelope)).await.is_ok()
    }

    /// Ask the group to remove a member and close its outbound queue.
    ///
    /// Returns `false` if the group is gone.
    pub async fn leave(&self, key: MemberKey) -> bool {
        self.leave_tx.send(key).await.is_ok()
    }

    /// Add a member and wait until the loop has recorded it.
    pub(crate) async fn join(&self, member: Member) -> Result<(), RelayError> {
        let (ack, acked) = oneshot::channel();
        self.join_tx
            .send(JoinRequest { member, ack })
            .await
            .map_err(|_| self.gone())?;
        acked.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> RelayError {
        RelayError::NotFound(self.id.to_string())
    }
}

/// The receiving ends of a group's control channels.
struct Inbox {
    join_rx: mpsc::Receiver<JoinRequest>,
    leave_rx: mpsc::Receiver<MemberKey>,
    broadcast_rx: mpsc::Receiver<Arc<Envelope>>,
    close_rx: oneshot::Receiver<()>,
}

/// Why a group loop exited.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Closed,
    Empty,
}

/// Create a group and start its control loop.
///
/// Returns the handle, the sender that closes the broadcast path (sending
/// or dropping it both count), and the loop's task.
pub(crate) fn spawn(
    id: &str,
    settings: &GroupSettings,
    registry: mpsc::WeakSender<RegistryCommand>,
) -> (GroupHandle, oneshot::Sender<()>, JoinHandle<()>) {
    let capacity = settings.inbox_capacity.max(1);
    let (join_tx, join_rx) = mpsc::channel(capacity);
    let (leave_tx, leave_rx) = mpsc::channel(capacity);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = oneshot::channel();

    let id: Arc<str> = Arc::from(id);
    let instance = GroupInstance::next();

    let handle = GroupHandle {
        id: Arc::clone(&id),
        instance,
        join_tx,
        leave_tx,
        broadcast_tx,
    };
    let group = Group::new(id, instance, settings, registry);
    let inbox = Inbox {
        join_rx,
        leave_rx,
        broadcast_rx,
        close_rx,
    };

    let task = tokio::spawn(group.run(inbox));
    (handle, close_tx, task)
}

/// State owned by a group's control loop.
pub(crate) struct Group {
    id: Arc<str>,
    instance: GroupInstance,
    members: HashMap<MemberKey, Member>,
    state: GroupState,
    echo_to_sender: bool,
    dropped: Arc<AtomicU64>,
    registry: mpsc::WeakSender<RegistryCommand>,
}

impl Group {
    fn new(
        id: Arc<str>,
        instance: GroupInstance,
        settings: &GroupSettings,
        registry: mpsc::WeakSender<RegistryCommand>,
    ) -> Self {
        Self {
            id,
            instance,
            members: HashMap::new(),
            state: GroupState::Idle,
            echo_to_sender: settings.echo_to_sender,
            dropped: Arc::clone(&settings.dropped),
            registry,
        }
    }

    async fn run(mut self, mut inbox: Inbox) {
        debug!(group = %self.id, instance = %self.instance, "Group loop started");

        // No `biased;`: ready branches are polled in random order so none
        // of the channels can starve the others.
        let exit = loop {
            tokio::select! {
                _ = &mut inbox.close_rx => {
                    self.drain();
                    break Exit::Closed;
                }
                Some(envelope) = inbox.broadcast_rx.recv() => {
                    self.fan_out(&envelope);
                }
                Some(request) = inbox.join_rx.recv() => {
                    if self.admit(request) {
                        break Exit::Empty;
                    }
                }
                Some(key) = inbox.leave_rx.recv() => {
                    if self.release(key) {
                        break Exit::Empty;
                    }
                }
            }
        };

        self.state = GroupState::Terminated;
        // Pending joins are refused from here on.
        drop(inbox);

        if exit == Exit::Empty {
            self.retire().await;
        }

        debug!(group = %self.id, instance = %self.instance, reason = ?exit, "Group loop terminated");
    }

    /// Push a message onto every member's outbound queue.
    ///
    /// Never blocks: a member whose queue is full misses the message.
    /// Returns the number of members the message was queued for.
    fn fan_out(&mut self, envelope: &Arc<Envelope>) -> usize {
        let mut delivered = 0;

        for member in self.members.values_mut() {
            if !self.echo_to_sender && member.key == envelope.origin {
                continue;
            }

            match member.outbound.try_send(Arc::clone(envelope)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    member.dropped += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        group = %self.id,
                        member = %member.tag,
                        dropped = member.dropped,
                        "Outbound queue full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    // Writer already gone; its receive side will leave.
                    trace!(group = %self.id, member = %member.tag, "Outbound queue closed");
                }
            }
        }

        trace!(
            group = %self.id,
            message = envelope.id,
            sender = %envelope.sender,
            recipients = delivered,
            "Fanned out"
        );
        delivered
    }

    /// Add a member. Returns `true` when the group should terminate.
    fn admit(&mut self, request: JoinRequest) -> bool {
        let JoinRequest { member, ack } = request;
        let key = member.key;

        debug_assert!(
            !self.members.contains_key(&key),
            "member {key} joined twice"
        );

        let tag = member.tag.clone();
        self.members.insert(key, member);

        if ack.send(()).is_err() {
            // The joiner gave up; nobody will ever pump this member.
            self.members.remove(&key);
            trace!(group = %self.id, member = %tag, "Join abandoned");
            return self.state == GroupState::Running && self.members.is_empty();
        }

        // Only a member whose join completed starts the group.
        if self.state == GroupState::Idle {
            self.state = GroupState::Running;
        }
        debug!(
            group = %self.id,
            member = %tag,
            members = self.members.len(),
            "Member joined"
        );
        false
    }

    /// Remove a member. Returns `true` when the group should terminate.
    fn release(&mut self, key: MemberKey) -> bool {
        if let Some(member) = self.members.remove(&key) {
            debug!(
                group = %self.id,
                member = %member.tag,
                dropped = member.dropped,
                members = self.members.len(),
                "Member left"
            );
        }

        self.state == GroupState::Running && self.members.is_empty()
    }

    /// Close every member's queue after the broadcast path was closed.
    fn drain(&mut self) {
        self.state = GroupState::Draining;
        let count = self.members.len();
        self.members.clear();
        debug!(group = %self.id, closed = count, "Group drained");
    }

    /// Ask the registry to forget this group.
    async fn retire(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let command = RegistryCommand::Retire {
            id: self.id.to_string(),
            instance: self.instance,
        };
        if registry.send(command).await.is_err() {
            trace!(group = %self.id, "Registry gone before retire");
        }
    }

    #[cfg(test)]
    fn member_keys(&self) -> std::collections::BTreeSet<MemberKey> {
        self.members.keys().copied().collect()
    }
}
