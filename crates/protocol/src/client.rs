//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{Actor, ChannelRef};

/// Messages sent from client to server.
///
/// The first message on every connection must be `Hello`; everything else is
/// rejected with a `permission` error until the actor is established.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare this connection's actor. If the connection carried a valid
    /// auth token, the authenticated account wins over the declared actor.
    Hello {
        actor: Actor,
    },

    // Subscriptions
    Subscribe {
        channel: ChannelRef,
    },
    Unsubscribe {
        channel: ChannelRef,
    },
    /// Announce presence on a channel. Sent exactly once after the
    /// `Subscribed` confirmation, never before.
    Track {
        channel: ChannelRef,
    },

    // Log access
    FetchHistory {
        channel: ChannelRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    SendMessage {
        channel: ChannelRef,
        content: String,
        /// Client-generated id echoed on the resulting insert event so the
        /// sender can reconcile its optimistic entry.
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },

    // Groups
    CreateGroup {
        name: String,
        description: String,
    },
    ListGroups,

    // Moderation (admin only)
    DeleteMessage {
        message_id: String,
    },
    SetGroupClosed {
        group_id: String,
        closed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DeleteGroup {
        group_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_hello_with_anonymous_actor() {
        let json = r#"{
          "type":"hello",
          "actor":{"kind":"anonymous","anonymous_id":"a-1","nickname":"RoterAdler9"}
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse hello");
        match parsed {
            ClientMessage::Hello { actor } => {
                assert_eq!(actor.nickname(), "RoterAdler9");
                assert!(actor.is_anonymous());
            }
            other => panic!("unexpected message variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_subscribe_group_channel() {
        let json = r#"{
          "type":"subscribe",
          "channel":{"kind":"group","group_id":"g-42"}
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse subscribe");
        match &parsed {
            ClientMessage::Subscribe { channel } => {
                assert_eq!(channel.group_id(), Some("g-42"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ClientMessage = serde_json::from_str(&serialized).expect("reparse");
    }

    #[test]
    fn send_message_without_correlation_id() {
        let json = r#"{
          "type":"send_message",
          "channel":{"kind":"global"},
          "content":"Hallo Stade!"
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse send_message");
        match parsed {
            ClientMessage::SendMessage {
                content,
                correlation_id,
                ..
            } => {
                assert_eq!(content, "Hallo Stade!");
                assert!(correlation_id.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_set_group_closed_with_reason() {
        let json = r#"{
          "type":"set_group_closed",
          "group_id":"g-1",
          "closed":true,
          "reason":"Spam"
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse set_group_closed");
        match &parsed {
            ClientMessage::SetGroupClosed {
                group_id,
                closed,
                reason,
            } => {
                assert_eq!(group_id, "g-1");
                assert!(*closed);
                assert_eq!(reason.as_deref(), Some("Spam"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ClientMessage = serde_json::from_str(&serialized).expect("roundtrip");
    }

    #[test]
    fn fetch_history_limit_defaults_to_none() {
        let json = r#"{"type":"fetch_history","channel":{"kind":"global"}}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse fetch_history");
        match parsed {
            ClientMessage::FetchHistory { limit, .. } => assert!(limit.is_none()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
