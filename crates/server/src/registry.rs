//! Channel registry — lazily spawned channel actors keyed by channel ref.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use stadtchat_protocol::{Actor, ChannelRef, Group};

use crate::channel::ChannelHandle;
use crate::error::ChatError;
use crate::store::Store;

/// Shared server state: the store plus one actor per open channel.
pub struct ChannelRegistry {
    store: Store,
    channels: DashMap<ChannelRef, ChannelHandle>,
    next_connection_id: AtomicU64,
}

impl ChannelRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            channels: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Allocate an id for a new WebSocket connection. Presence entries are
    /// keyed by this, so two tabs of one actor stay distinct.
    pub fn allocate_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the actor for a channel, spawning it on first use. Unknown groups
    /// are a `NotFoundError`.
    pub async fn get_or_spawn(&self, channel: ChannelRef) -> Result<ChannelHandle, ChatError> {
        if let Some(handle) = self.channels.get(&channel) {
            return Ok(handle.clone());
        }

        let group = match &channel {
            ChannelRef::Global => None,
            ChannelRef::Group { group_id } => {
                let group = self
                    .store
                    .get_group(group_id.clone())
                    .await?
                    .ok_or_else(|| ChatError::NotFound(format!("group {group_id}")))?;
                Some(group)
            }
        };

        // A concurrent caller may have spawned in the meantime; keep theirs.
        let handle = self
            .channels
            .entry(channel.clone())
            .or_insert_with(|| ChannelHandle::spawn(channel, self.store.clone(), group))
            .clone();
        Ok(handle)
    }

    pub async fn create_group(
        &self,
        actor: &Actor,
        name: String,
        description: String,
    ) -> Result<Group, ChatError> {
        let Some(user_id) = actor.user_id() else {
            return Err(ChatError::Permission(
                "only authenticated users can create groups".to_string(),
            ));
        };
        self.store
            .create_group(name, description, user_id.to_string())
            .await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ChatError> {
        self.store.list_groups().await
    }

    /// Cascade-delete the group. When the channel actor is running, the
    /// cascade goes through its command queue so no append can land between
    /// the cascade and the actor stopping.
    pub async fn delete_group(&self, group_id: String) -> Result<(), ChatError> {
        let channel = ChannelRef::Group {
            group_id: group_id.clone(),
        };

        let handle = self.channels.get(&channel).map(|h| h.clone());
        match handle {
            Some(handle) => {
                handle.delete_group().await?;
                self.channels.remove(&channel);
            }
            None => self.store.delete_group(group_id).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (tempfile::TempDir, ChannelRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("chat.db");
        let mut conn = rusqlite::Connection::open(&db_path).expect("open db");
        crate::migration_runner::run_migrations(&mut conn).expect("migrate");
        (dir, ChannelRegistry::new(Store::new(db_path)))
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let (_dir, registry) = test_registry();
        let a = registry.allocate_connection_id();
        let b = registry.allocate_connection_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn global_channel_spawns_once() {
        let (_dir, registry) = test_registry();
        let first = registry
            .get_or_spawn(ChannelRef::Global)
            .await
            .expect("spawn");
        let second = registry
            .get_or_spawn(ChannelRef::Global)
            .await
            .expect("reuse");
        assert_eq!(first.channel, second.channel);
        assert_eq!(registry.channels.len(), 1);
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let (_dir, registry) = test_registry();
        let err = registry
            .get_or_spawn(ChannelRef::Group {
                group_id: "missing".to_string(),
            })
            .await
            .expect_err("unknown group");
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn anonymous_actors_cannot_create_groups() {
        let (_dir, registry) = test_registry();
        let err = registry
            .create_group(
                &Actor::Anonymous {
                    anonymous_id: "a".to_string(),
                    nickname: "A".to_string(),
                },
                "Stammtisch".to_string(),
                String::new(),
            )
            .await
            .expect_err("anonymous creator");
        assert!(matches!(err, ChatError::Permission(_)));
    }

    #[tokio::test]
    async fn delete_group_stops_the_actor() {
        let (_dir, registry) = test_registry();
        let group = registry
            .create_group(
                &Actor::Authenticated {
                    user_id: "user-1".to_string(),
                },
                "Kurzlebig".to_string(),
                String::new(),
            )
            .await
            .expect("create");

        let channel = ChannelRef::Group {
            group_id: group.id.clone(),
        };
        registry
            .get_or_spawn(channel.clone())
            .await
            .expect("spawn");

        registry.delete_group(group.id.clone()).await.expect("delete");
        assert!(registry.channels.get(&channel).is_none());

        // The registry row is gone, so re-opening the channel fails.
        let err = registry
            .get_or_spawn(channel)
            .await
            .expect_err("group deleted");
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn deleted_group_rejects_appends_through_held_handles() {
        let (_dir, registry) = test_registry();
        let group = registry
            .create_group(
                &Actor::Authenticated {
                    user_id: "user-1".to_string(),
                },
                "Fluechtig".to_string(),
                String::new(),
            )
            .await
            .expect("create");

        let channel = ChannelRef::Group {
            group_id: group.id.clone(),
        };
        let handle = registry
            .get_or_spawn(channel.clone())
            .await
            .expect("spawn");
        let anon = Actor::Anonymous {
            anonymous_id: "a".to_string(),
            nickname: "A".to_string(),
        };
        handle
            .append(anon.clone(), false, "before".to_string(), None)
            .await
            .expect("append");

        registry.delete_group(group.id.clone()).await.expect("delete");

        // A connection still holding the handle cannot write past the
        // cascade; the row set stays empty.
        let err = handle
            .append(anon, false, "after".to_string(), None)
            .await
            .expect_err("deleted group");
        assert!(matches!(err, ChatError::NotFound(_)));

        let history = registry
            .store()
            .fetch_history(channel, None)
            .await
            .expect("history");
        assert!(history.is_empty());
    }
}
