//! Channel actor — owns one channel's fan-out, presence set, and group gate.
//!
//! Each open channel runs as an independent tokio task. All appends and
//! moderation writes for the channel flow through its command queue, so the
//! order in which commits land in the store is exactly the order in which
//! insert events are broadcast to subscribers. Presence is a pure projection
//! of the currently tracked connections, recomputed on every change.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use stadtchat_protocol::{Actor, ChannelRef, ChatMessage, Group, ServerMessage};

use crate::error::ChatError;
use crate::store::Store;

/// Buffer for the per-channel broadcast. Subscribers that fall further behind
/// than this get a `lagged` notice and must refetch history.
const BROADCAST_BUFFER: usize = 256;

/// A command that can be sent to a channel actor.
pub enum ChannelCommand {
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<ServerMessage>>,
    },
    FetchHistory {
        limit: Option<u32>,
        reply: oneshot::Sender<Result<Vec<ChatMessage>, ChatError>>,
    },
    Append {
        actor: Actor,
        is_admin: bool,
        content: String,
        correlation_id: Option<String>,
        reply: oneshot::Sender<Result<ChatMessage, ChatError>>,
    },
    SoftDelete {
        message_id: String,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Track {
        connection_id: u64,
        actor: Actor,
    },
    Untrack {
        connection_id: u64,
    },
    SetClosed {
        closed: bool,
        reason: Option<String>,
        closed_by: String,
        reply: oneshot::Sender<Result<Group, ChatError>>,
    },
    /// Cascade-delete the group from the store, broadcast `GroupDeleted`,
    /// and stop the actor. Runs inside the command loop, so no append can
    /// land between the cascade and the stop.
    DeleteGroup {
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
}

/// Handle to a running channel actor (cheap to clone).
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    pub channel: ChannelRef,
    command_tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// Spawn an actor for the given channel. `group` is the cached registry
    /// row for group channels, None for the global channel.
    pub fn spawn(channel: ChannelRef, store: Store, group: Option<Group>) -> ChannelHandle {
        let (command_tx, command_rx) = mpsc::channel(BROADCAST_BUFFER);
        let actor = ChannelActor {
            channel: channel.clone(),
            store,
            group,
            broadcast_tx: broadcast::channel(BROADCAST_BUFFER).0,
            presence: HashMap::new(),
        };

        tokio::spawn(actor.run(command_rx));

        ChannelHandle {
            channel,
            command_tx,
        }
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<ServerMessage>, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Subscribe { reply: tx }).await?;
        rx.await
            .map_err(|_| self.gone())
    }

    pub async fn fetch_history(
        &self,
        limit: Option<u32>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::FetchHistory { limit, reply: tx })
            .await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn append(
        &self,
        actor: Actor,
        is_admin: bool,
        content: String,
        correlation_id: Option<String>,
    ) -> Result<ChatMessage, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Append {
            actor,
            is_admin,
            content,
            correlation_id,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn soft_delete(&self, message_id: String) -> Result<(), ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::SoftDelete {
            message_id,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn track(&self, connection_id: u64, actor: Actor) -> Result<(), ChatError> {
        self.send(ChannelCommand::Track {
            connection_id,
            actor,
        })
        .await
    }

    pub async fn untrack(&self, connection_id: u64) -> Result<(), ChatError> {
        self.send(ChannelCommand::Untrack { connection_id }).await
    }

    pub async fn set_closed(
        &self,
        closed: bool,
        reason: Option<String>,
        closed_by: String,
    ) -> Result<Group, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::SetClosed {
            closed,
            reason,
            closed_by,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn delete_group(&self) -> Result<(), ChatError> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::DeleteGroup { reply: tx }).await?;
        rx.await.map_err(|_| self.gone())?
    }

    async fn send(&self, cmd: ChannelCommand) -> Result<(), ChatError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| self.gone())
    }

    fn gone(&self) -> ChatError {
        // A dead group actor means the group was deleted from under us.
        match &self.channel {
            ChannelRef::Global => {
                ChatError::ChannelUnavailable("global channel actor stopped".to_string())
            }
            ChannelRef::Group { group_id } => ChatError::NotFound(format!("group {group_id}")),
        }
    }
}

struct ChannelActor {
    channel: ChannelRef,
    store: Store,
    group: Option<Group>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    presence: HashMap<u64, Actor>,
}

impl ChannelActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<ChannelCommand>) {
        info!(
            component = "channel",
            event = "channel.started",
            channel = %self.channel,
            "Channel actor started"
        );

        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                ChannelCommand::Subscribe { reply } => {
                    let _ = reply.send(self.broadcast_tx.subscribe());
                }
                ChannelCommand::FetchHistory { limit, reply } => {
                    let result = self
                        .store
                        .fetch_history(self.channel.clone(), limit)
                        .await;
                    let _ = reply.send(result);
                }
                ChannelCommand::Append {
                    actor,
                    is_admin,
                    content,
                    correlation_id,
                    reply,
                } => {
                    let result = self.handle_append(actor, is_admin, content).await;
                    match result {
                        Ok(message) => {
                            self.broadcast(ServerMessage::MessageInserted {
                                channel: self.channel.clone(),
                                message: message.clone(),
                                correlation_id,
                            });
                            let _ = reply.send(Ok(message));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                ChannelCommand::SoftDelete { message_id, reply } => {
                    let result = self.store.mark_deleted(message_id.clone()).await;
                    match result {
                        Ok(_) => {
                            self.broadcast(ServerMessage::MessageUpdated {
                                channel: self.channel.clone(),
                                message_id,
                                is_deleted: true,
                            });
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                ChannelCommand::Track {
                    connection_id,
                    actor,
                } => {
                    self.presence.insert(connection_id, actor);
                    self.broadcast_presence();
                }
                ChannelCommand::Untrack { connection_id } => {
                    if self.presence.remove(&connection_id).is_some() {
                        self.broadcast_presence();
                    }
                }
                ChannelCommand::SetClosed {
                    closed,
                    reason,
                    closed_by,
                    reply,
                } => {
                    let result = self.handle_set_closed(closed, reason, closed_by).await;
                    match result {
                        Ok(group) => {
                            self.broadcast(ServerMessage::GroupUpdated {
                                group: group.clone(),
                            });
                            let _ = reply.send(Ok(group));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                ChannelCommand::DeleteGroup { reply } => {
                    match self.handle_delete_group().await {
                        Ok(group_id) => {
                            self.broadcast(ServerMessage::GroupDeleted { group_id });
                            let _ = reply.send(Ok(()));
                            break;
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
        }

        info!(
            component = "channel",
            event = "channel.stopped",
            channel = %self.channel,
            "Channel actor stopped"
        );
    }

    /// Closed-group gate, then the store write. Serialized through this
    /// actor, so broadcast order equals commit order.
    async fn handle_append(
        &mut self,
        actor: Actor,
        is_admin: bool,
        content: String,
    ) -> Result<ChatMessage, ChatError> {
        if let Some(group) = &self.group {
            if group.is_closed && !is_admin {
                return Err(ChatError::Permission(format!(
                    "group {} is closed",
                    group.id
                )));
            }
        }

        self.store
            .append(self.channel.clone(), actor, content)
            .await
    }

    async fn handle_set_closed(
        &mut self,
        closed: bool,
        reason: Option<String>,
        closed_by: String,
    ) -> Result<Group, ChatError> {
        let Some(group) = &self.group else {
            return Err(ChatError::Validation(
                "the global channel cannot be closed".to_string(),
            ));
        };

        let updated = self
            .store
            .set_group_closed(group.id.clone(), closed, reason, Some(closed_by))
            .await?;

        // Keep the cached gate in sync with the registry row.
        self.group = Some(updated.clone());
        Ok(updated)
    }

    async fn handle_delete_group(&mut self) -> Result<String, ChatError> {
        let ChannelRef::Group { group_id } = &self.channel else {
            return Err(ChatError::Validation(
                "the global channel cannot be deleted".to_string(),
            ));
        };

        self.store.delete_group(group_id.clone()).await?;
        Ok(group_id.clone())
    }

    fn broadcast(&self, msg: ServerMessage) {
        // Send fails only when no subscriber is attached; that is fine.
        if self.broadcast_tx.send(msg).is_err() {
            debug!(
                component = "channel",
                event = "channel.broadcast.no_subscribers",
                channel = %self.channel,
            );
        }
    }

    fn broadcast_presence(&self) {
        let count = self.presence.len();
        if count > u32::MAX as usize {
            warn!(
                component = "channel",
                event = "channel.presence.overflow",
                channel = %self.channel,
            );
        }
        self.broadcast(ServerMessage::PresenceSync {
            channel: self.channel.clone(),
            count: count as u32,
            actors: self.presence.values().cloned().collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("chat.db");
        let mut conn = rusqlite::Connection::open(&db_path).expect("open db");
        crate::migration_runner::run_migrations(&mut conn).expect("migrate");
        (dir, Store::new(db_path))
    }

    fn anon(id: &str, nickname: &str) -> Actor {
        Actor::Anonymous {
            anonymous_id: id.to_string(),
            nickname: nickname.to_string(),
        }
    }

    async fn recv_insert(rx: &mut broadcast::Receiver<ServerMessage>) -> ChatMessage {
        loop {
            match rx.recv().await.expect("broadcast open") {
                ServerMessage::MessageInserted { message, .. } => return message,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn subscribers_observe_commit_order() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let mut rx_a = handle.subscribe().await.expect("subscribe a");
        let mut rx_b = handle.subscribe().await.expect("subscribe b");

        for i in 0..10 {
            handle
                .append(anon("a", "A"), false, format!("msg {i}"), None)
                .await
                .expect("append");
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let mut last_seq = None;
            for i in 0..10 {
                let message = recv_insert(rx).await;
                assert_eq!(message.content, format!("msg {i}"));
                if let Some(prev) = last_seq {
                    assert!(message.seq > prev);
                }
                last_seq = Some(message.seq);
            }
        }
    }

    #[tokio::test]
    async fn correlation_id_is_echoed_with_the_insert() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let mut rx = handle.subscribe().await.expect("subscribe");
        handle
            .append(anon("a", "A"), false, "Hallo Stade!".to_string(), Some("c-7".to_string()))
            .await
            .expect("append");

        match rx.recv().await.expect("event") {
            ServerMessage::MessageInserted {
                message,
                correlation_id,
                ..
            } => {
                assert_eq!(message.content, "Hallo Stade!");
                assert_eq!(correlation_id.as_deref(), Some("c-7"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn soft_delete_broadcasts_update() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let mut rx = handle.subscribe().await.expect("subscribe");
        let message = handle
            .append(anon("a", "A"), false, "to be removed".to_string(), None)
            .await
            .expect("append");
        let _ = recv_insert(&mut rx).await;

        handle.soft_delete(message.id.clone()).await.expect("delete");

        match rx.recv().await.expect("event") {
            ServerMessage::MessageUpdated {
                message_id,
                is_deleted,
                ..
            } => {
                assert_eq!(message_id, message.id);
                assert!(is_deleted);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // History after the delete excludes the message.
        let history = handle.fetch_history(None).await.expect("history");
        assert!(history.iter().all(|m| m.id != message.id));
    }

    #[tokio::test]
    async fn presence_counts_connections_not_actors() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let mut rx = handle.subscribe().await.expect("subscribe");
        let actor = anon("same", "Same");

        // Two tabs of the same actor.
        handle.track(1, actor.clone()).await.expect("track 1");
        handle.track(2, actor.clone()).await.expect("track 2");

        let mut last_count = 0;
        for _ in 0..2 {
            match rx.recv().await.expect("event") {
                ServerMessage::PresenceSync { count, actors, .. } => {
                    last_count = count;
                    assert_eq!(actors.len() as u32, count);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(last_count, 2);

        handle.untrack(1).await.expect("untrack");
        match rx.recv().await.expect("event") {
            ServerMessage::PresenceSync { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn untrack_of_unknown_connection_is_silent() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let mut rx = handle.subscribe().await.expect("subscribe");
        handle.untrack(99).await.expect("untrack unknown");
        handle.track(1, anon("a", "A")).await.expect("track");

        // The first event seen is the track, not a spurious sync for the
        // unknown untrack.
        match rx.recv().await.expect("event") {
            ServerMessage::PresenceSync { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_group_rejects_non_admin_appends() {
        let (_dir, store) = test_store();
        let group = store
            .create_group(
                "Stammtisch".to_string(),
                String::new(),
                "user-1".to_string(),
            )
            .await
            .expect("create group");
        let channel = ChannelRef::Group {
            group_id: group.id.clone(),
        };
        let handle = ChannelHandle::spawn(channel, store, Some(group));

        let mut rx = handle.subscribe().await.expect("subscribe");
        let closed = handle
            .set_closed(true, Some("Spam".to_string()), "admin-1".to_string())
            .await
            .expect("close");
        assert!(closed.is_closed);

        match rx.recv().await.expect("event") {
            ServerMessage::GroupUpdated { group } => {
                assert!(group.is_closed);
                assert_eq!(group.closed_reason.as_deref(), Some("Spam"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let err = handle
            .append(anon("a", "A"), false, "hi".to_string(), None)
            .await
            .expect_err("closed group rejects non-admin");
        assert!(matches!(err, ChatError::Permission(_)));

        // Admins can still write and moderate.
        handle
            .append(
                Actor::Authenticated {
                    user_id: "admin-1".to_string(),
                },
                true,
                "moderator note".to_string(),
                None,
            )
            .await
            .expect("admin append");
    }

    #[tokio::test]
    async fn delete_group_broadcasts_and_stops_the_actor() {
        let (_dir, store) = test_store();
        let group = store
            .create_group("Kurzlebig".to_string(), String::new(), "user-1".to_string())
            .await
            .expect("create group");
        let channel = ChannelRef::Group {
            group_id: group.id.clone(),
        };
        let handle = ChannelHandle::spawn(channel.clone(), store.clone(), Some(group.clone()));

        let mut rx = handle.subscribe().await.expect("subscribe");
        handle
            .append(anon("a", "A"), false, "before".to_string(), None)
            .await
            .expect("append");
        let _ = recv_insert(&mut rx).await;

        handle.delete_group().await.expect("delete");

        match rx.recv().await.expect("event") {
            ServerMessage::GroupDeleted { group_id } => assert_eq!(group_id, group.id),
            other => panic!("unexpected event: {:?}", other),
        }

        // The cascade and the stop are one step in the command loop, so a
        // send through a held handle cannot re-insert rows afterwards.
        let err = handle
            .append(anon("a", "A"), false, "too late".to_string(), None)
            .await
            .expect_err("actor stopped");
        assert!(matches!(err, ChatError::NotFound(_)));

        let history = store.fetch_history(channel, None).await.expect("history");
        assert!(history.is_empty());
        assert!(store.get_group(group.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn global_channel_cannot_be_deleted() {
        let (_dir, store) = test_store();
        let handle = ChannelHandle::spawn(ChannelRef::Global, store, None);

        let err = handle.delete_group().await.expect_err("global is permanent");
        assert!(matches!(err, ChatError::Validation(_)));

        // The actor keeps running.
        handle
            .append(anon("a", "A"), false, "still here".to_string(), None)
            .await
            .expect("append");
    }
}
