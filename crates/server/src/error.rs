//! Error taxonomy for the chat subsystem.
//!
//! Every failure surfaced to a client maps to a stable error code so the
//! client can decide whether to retry (transport), re-edit (validation), or
//! give up (permission, not found).

use stadtchat_protocol::{ChannelRef, ServerMessage};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Empty or oversized content. Recovered locally; the message stays
    /// editable and is never sent to the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Closed group or non-admin moderation attempt. Surfaced as a notice,
    /// not retried.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Unknown group or message, e.g. a group deleted while a client still
    /// had it open.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Actor task gone or reply channel dropped mid-operation.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),
}

impl ChatError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Permission(_) => "permission",
            ChatError::NotFound(_) => "not_found",
            ChatError::Storage(_) => "internal",
            ChatError::ChannelUnavailable(_) => "internal",
        }
    }

    /// Build the wire representation, optionally scoped to a channel.
    pub fn to_server_message(&self, channel: Option<ChannelRef>) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::Validation("x".into()).code(), "validation");
        assert_eq!(ChatError::Permission("x".into()).code(), "permission");
        assert_eq!(ChatError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            ChatError::ChannelUnavailable("x".into()).code(),
            "internal"
        );
    }

    #[test]
    fn wire_form_carries_channel_scope() {
        let err = ChatError::Permission("group is closed".into());
        let msg = err.to_server_message(Some(ChannelRef::Global));
        match msg {
            ServerMessage::Error { code, channel, .. } => {
                assert_eq!(code, "permission");
                assert_eq!(channel, Some(ChannelRef::Global));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
