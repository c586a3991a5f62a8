//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{Actor, ChannelRef, ChatMessage, Group};

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `Hello`: the actor this connection is attributed as.
    Welcome {
        actor: Actor,
        is_admin: bool,
    },

    /// Subscription is active; live events for the channel follow in commit
    /// order. The client sends `Track` only after receiving this.
    Subscribed {
        channel: ChannelRef,
    },

    History {
        channel: ChannelRef,
        messages: Vec<ChatMessage>,
    },

    // Incremental updates
    MessageInserted {
        channel: ChannelRef,
        message: ChatMessage,
        /// The sender's correlation id, broadcast with the insert so the
        /// sender can match its optimistic copy; other clients ignore it.
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    MessageUpdated {
        channel: ChannelRef,
        message_id: String,
        is_deleted: bool,
    },

    /// Live attachment set for a channel, recomputed on every join/leave.
    /// `count` is per connection: one actor with two tabs counts as 2.
    PresenceSync {
        channel: ChannelRef,
        count: u32,
        actors: Vec<Actor>,
    },

    // Group lifecycle
    GroupCreated {
        group: Group,
    },
    GroupUpdated {
        group: Group,
    },
    GroupDeleted {
        group_id: String,
    },
    GroupsList {
        groups: Vec<Group>,
    },

    // Errors
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<ChannelRef>,
    },
}
