//! The process-wide directory of live groups.
//!
//! One [`Registry`] task owns the map from group id to group. Everything
//! else talks to it through a cloneable [`RegistryHandle`]; creation,
//! removal and lookups are all requests served by the task in order.

use crate::error::RelayError;
use crate::group::{self, GroupHandle, GroupSettings};
use crate::id::GroupInstance;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

/// Registry command channel capacity.
const COMMAND_CAPACITY: usize = 256;

/// Requests served by the registry loop.
#[derive(Debug)]
pub(crate) enum RegistryCommand {
    /// Create a group under `id`. With `exclusive` an existing id is a
    /// conflict; without it the new group replaces the old one.
    Register {
        id: String,
        exclusive: bool,
        reply: oneshot::Sender<Result<GroupHandle, RelayError>>,
    },
    /// Remove a group and close its broadcast path.
    Unregister {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    /// Sent by a group that terminated on its own.
    Retire {
        id: String,
        instance: GroupInstance,
    },
    Lookup {
        id: String,
        reply: oneshot::Sender<Option<GroupHandle>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// A registered group and the means to close its broadcast path.
struct Entry {
    handle: GroupHandle,
    close: oneshot::Sender<()>,
}

impl Entry {
    fn close(self) {
        // The group may have exited already; dropping is enough either way.
        let _ = self.close.send(());
    }
}

/// The registry loop state.
pub(crate) struct Registry {
    groups: HashMap<String, Entry>,
    commands: mpsc::Receiver<RegistryCommand>,
    weak: mpsc::WeakSender<RegistryCommand>,
    settings: GroupSettings,
}

impl Registry {
    /// Start the registry task and return a handle to it.
    ///
    /// The task runs until every handle has been dropped, then closes the
    /// broadcast path of each remaining group.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub(crate) fn spawn(settings: GroupSettings) -> RegistryHandle {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let registry = Self {
            groups: HashMap::new(),
            commands,
            weak: tx.downgrade(),
            settings,
        };
        tokio::spawn(registry.run());
        RegistryHandle { tx }
    }

    async fn run(mut self) {
        debug!("Registry started");

        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }

        let remaining = self.groups.len();
        for (_, entry) in self.groups.drain() {
            entry.close();
        }
        debug!(groups = remaining, "Registry stopped");
    }

    fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register {
                id,
                exclusive,
                reply,
            } => {
                let _ = reply.send(self.register(id, exclusive));
            }

            RegistryCommand::Unregister { id, reply } => {
                let found = match self.groups.remove(&id) {
                    Some(entry) => {
                        entry.close();
                        info!(group = %id, "Group deleted");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }

            RegistryCommand::Retire { id, instance } => {
                let current = self
                    .groups
                    .get(&id)
                    .is_some_and(|entry| entry.handle.instance() == instance);
                if current {
                    self.groups.remove(&id);
                    info!(group = %id, "Group emptied and removed");
                } else {
                    trace!(group = %id, instance = %instance, "Stale retire ignored");
                }
            }

            RegistryCommand::Lookup { id, reply } => {
                let found = self.groups.get(&id).map(|entry| entry.handle.clone());
                let _ = reply.send(found);
            }

            RegistryCommand::List { reply } => {
                let _ = reply.send(self.groups.keys().cloned().collect());
            }

            RegistryCommand::Len { reply } => {
                let _ = reply.send(self.groups.len());
            }
        }
    }

    fn register(&mut self, id: String, exclusive: bool) -> Result<GroupHandle, RelayError> {
        if exclusive && self.groups.contains_key(&id) {
            return Err(RelayError::AlreadyExists(id));
        }

        let (handle, close, _task) = group::spawn(&id, &self.settings, self.weak.clone());
        let entry = Entry {
            handle: handle.clone(),
            close,
        };

        if let Some(previous) = self.groups.insert(id.clone(), entry) {
            debug!(group = %id, "Replacing group, closing the previous one");
            previous.close();
        }
        info!(group = %id, groups = self.groups.len(), "Group created");

        Ok(handle)
    }
}

/// Handle to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Create a group under `id`, replacing any group already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn register(&self, id: &str) -> Result<GroupHandle, RelayError> {
        self.request(|reply| RegistryCommand::Register {
            id: id.to_string(),
            exclusive: false,
            reply,
        })
        .await?
    }

    /// Create a group under `id` unless the id is taken.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyExists`] if the id is taken.
    pub async fn create(&self, id: &str) -> Result<GroupHandle, RelayError> {
        self.request(|reply| RegistryCommand::Register {
            id: id.to_string(),
            exclusive: true,
            reply,
        })
        .await?
    }

    /// Remove a group and close its broadcast path.
    ///
    /// Returns whether the id was registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn unregister(&self, id: &str) -> Result<bool, RelayError> {
        self.request(|reply| RegistryCommand::Unregister {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Find a live group.
    ///
    /// The group may close right after this returns; callers find out when
    /// their next operation on the handle fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn lookup(&self, id: &str) -> Result<Option<GroupHandle>, RelayError> {
        self.request(|reply| RegistryCommand::Lookup {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Get all registered group ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn group_ids(&self) -> Result<Vec<String>, RelayError> {
        self.request(|reply| RegistryCommand::List { reply }).await
    }

    /// Get the number of registered groups.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry task has stopped.
    pub async fn len(&self) -> Result<usize, RelayError> {
        self.request(|reply| RegistryCommand::Len { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RelayError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| RelayError::RegistryStopped)?;
        response.await.map_err(|_| RelayError::RegistryStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn registry() -> RegistryHandle {
        Registry::spawn(GroupSettings {
            inbox_capacity: 16,
            echo_to_sender: false,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn wait_closed(handle: &GroupHandle) {
        timeout(WAIT, async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lookup_after_register_and_unregister() {
        let registry = registry();

        let group = registry.register("lobby").await.unwrap();
        let found = registry.lookup("lobby").await.unwrap().unwrap();
        assert_eq!(found.instance(), group.instance());
        assert_eq!(found.id(), "lobby");

        assert!(registry.unregister("lobby").await.unwrap());
        assert!(registry.lookup("lobby").await.unwrap().is_none());
        wait_closed(&group).await;
    }

    #[tokio::test]
    async fn test_unregister_missing_is_noop() {
        let registry = registry();
        let kept = registry.register("kept").await.unwrap();

        assert!(!registry.unregister("missing").await.unwrap());
        assert_eq!(registry.group_ids().await.unwrap(), vec!["kept".to_string()]);
        assert!(!kept.is_closed());
    }

    #[tokio::test]
    async fn test_create_rejects_existing_id() {
        let registry = registry();

        registry.create("room").await.unwrap();
        assert!(matches!(
            registry.create("room").await,
            Err(RelayError::AlreadyExists(id)) if id == "room"
        ));
    }

    #[tokio::test]
    async fn test_register_is_last_write_wins() {
        let registry = registry();

        let first = registry.register("room").await.unwrap();
        let second = registry.register("room").await.unwrap();
        assert_ne!(first.instance(), second.instance());

        let found = registry.lookup("room").await.unwrap().unwrap();
        assert_eq!(found.instance(), second.instance());
        wait_closed(&first).await;
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_double_delete() {
        let registry = registry();
        let group = registry.register("twice").await.unwrap();

        let (a, b) = tokio::join!(registry.unregister("twice"), registry.unregister("twice"));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|found| **found).count(), 1);
        wait_closed(&group).await;
    }

    #[tokio::test]
    async fn test_stale_retire_keeps_new_group() {
        let registry = registry();
        let old = registry.register("room").await.unwrap();
        let new = registry.register("room").await.unwrap();

        registry
            .tx
            .send(RegistryCommand::Retire {
                id: "room".into(),
                instance: old.instance(),
            })
            .await
            .unwrap();

        let found = registry.lookup("room").await.unwrap().unwrap();
        assert_eq!(found.instance(), new.instance());
    }

    #[tokio::test]
    async fn test_len_tracks_registered_groups() {
        let registry = registry();
        assert_eq!(registry.len().await.unwrap(), 0);

        registry.register("a").await.unwrap();
        registry.register("b").await.unwrap();
        registry.register("b").await.unwrap();
        assert_eq!(registry.len().await.unwrap(), 2);

        registry.unregister("a").await.unwrap();
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_groups() {
        let registry = registry();
        let group = registry.register("orphan").await.unwrap();

        drop(registry);
        wait_closed(&group).await;
    }
}
