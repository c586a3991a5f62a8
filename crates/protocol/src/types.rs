//! Core types shared across the protocol

use std::fmt;

use serde::{Deserialize, Serialize};

/// The identity attributed to a message or presence entry.
///
/// Exactly one variant per connection. Attribution is a tagged variant,
/// not nullable fields scattered across the message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Authenticated { user_id: String },
    Anonymous { anonymous_id: String, nickname: String },
}

impl Actor {
    /// Display handle for this actor.
    pub fn nickname(&self) -> &str {
        match self {
            Actor::Authenticated { user_id } => user_id,
            Actor::Anonymous { nickname, .. } => nickname,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Actor::Anonymous { .. })
    }

    /// User id for authenticated actors, None for anonymous ones.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::Authenticated { user_id } => Some(user_id),
            Actor::Anonymous { .. } => None,
        }
    }
}

/// A logical message stream: the single global chat or one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelRef {
    Global,
    Group { group_id: String },
}

impl ChannelRef {
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ChannelRef::Global => None,
            ChannelRef::Group { group_id } => Some(group_id),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Global => write!(f, "global"),
            ChannelRef::Group { group_id } => write!(f, "group:{group_id}"),
        }
    }
}

/// A message in a channel's append-only log.
///
/// `seq` is the per-channel commit sequence; subscribers observe inserts in
/// ascending `seq` order. Deleted rows are retained with `is_deleted = true`
/// (soft delete) and excluded from history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub channel: ChannelRef,
    pub seq: u64,
    pub content: String,
    pub display_nickname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<String>,
    pub is_anonymous: bool,
    pub is_deleted: bool,
    pub created_at: String,
}

/// A named group with its own chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: String,
    pub creator: Actor,
    pub is_closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<String>,
    pub created_at: String,
}

/// Content types accepted by the external reporting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportContentType {
    ChatMessage,
    GroupMessage,
}

/// Hand-off payload for the external reporting service. This subsystem only
/// produces the reference; it never processes reports itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub content_type: ReportContentType,
    pub content_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_serializes_as_tagged_variant() {
        let actor = Actor::Anonymous {
            anonymous_id: "anon-1".to_string(),
            nickname: "BlauerFuchs42".to_string(),
        };
        let json = serde_json::to_string(&actor).expect("serialize");
        assert!(json.contains("\"kind\":\"anonymous\""));

        let back: Actor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, actor);
        assert!(back.is_anonymous());
        assert_eq!(back.user_id(), None);
    }

    #[test]
    fn channel_ref_display_names_the_stream() {
        assert_eq!(ChannelRef::Global.to_string(), "global");
        assert_eq!(
            ChannelRef::Group {
                group_id: "g1".to_string()
            }
            .to_string(),
            "group:g1"
        );
    }

    #[test]
    fn authenticated_actor_exposes_user_id() {
        let actor = Actor::Authenticated {
            user_id: "user-7".to_string(),
        };
        assert_eq!(actor.user_id(), Some("user-7"));
        assert_eq!(actor.nickname(), "user-7");
        assert!(!actor.is_anonymous());
    }
}
