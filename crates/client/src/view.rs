//! Rendering contract
//!
//! What a chat row needs to draw itself, independent of transport details.

use chrono::{DateTime, Local};

use stadtchat_protocol::{Actor, ChannelRef, ChatMessage, ReportContentType, ReportRequest};

/// One rendered chat row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageData {
    pub id: String,
    pub nickname: String,
    pub message: String,
    /// Localized `HH:MM`, empty when the source timestamp is unparsable.
    pub timestamp: String,
    pub is_own: bool,
    /// Whether the viewing actor is an admin; the view uses this to show
    /// moderation affordances on the row.
    pub is_admin: bool,
}

impl ChatMessageData {
    /// Build a row from an authoritative message as seen by `viewer`.
    ///
    /// Anonymous attribution is by nickname: the wire message carries no
    /// anonymous id, so an anonymous viewer's own rows from a previous
    /// session (different nickname) render as foreign. Live sends are
    /// reconciled via correlation id before this path runs.
    pub fn from_message(msg: &ChatMessage, viewer: &Actor, viewer_is_admin: bool) -> Self {
        let is_own = match viewer {
            Actor::Authenticated { user_id } => msg.actor_user_id.as_deref() == Some(user_id),
            Actor::Anonymous { nickname, .. } => {
                msg.is_anonymous && msg.display_nickname == *nickname
            }
        };

        Self {
            id: msg.id.clone(),
            nickname: msg.display_nickname.clone(),
            message: msg.content.clone(),
            timestamp: format_timestamp(&msg.created_at),
            is_own,
            is_admin: viewer_is_admin,
        }
    }
}

/// Build the hand-off for the external reporting service. Global messages
/// report as `chat_message`, group messages as `group_message`.
pub fn report_request_for(channel: &ChannelRef, message_id: &str) -> ReportRequest {
    let content_type = match channel {
        ChannelRef::Global => ReportContentType::ChatMessage,
        ChannelRef::Group { .. } => ReportContentType::GroupMessage,
    };
    ReportRequest {
        content_type,
        content_id: message_id.to_string(),
    }
}

/// ISO 8601 → localized `HH:MM`.
fn format_timestamp(iso: &str) -> String {
    match DateTime::parse_from_rfc3339(iso) {
        Ok(dt) => dt.with_timezone(&Local).format("%H:%M").to_string(),
        Err(_) => String::new(),
    }
}
