//! Moderation entry points — admin-gated writes through the ordinary
//! store + fan-out path. Nothing here pushes directly to clients; other
//! subscribers observe moderation as regular log mutations.

use tracing::info;

use stadtchat_protocol::{ChannelRef, Group};

use crate::error::ChatError;
use crate::registry::ChannelRegistry;

fn require_admin(is_admin: bool, action: &str) -> Result<(), ChatError> {
    if is_admin {
        Ok(())
    } else {
        Err(ChatError::Permission(format!("{action} requires admin")))
    }
}

/// Soft-delete a message; the owning channel's fan-out propagates the update.
pub async fn delete_message(
    registry: &ChannelRegistry,
    is_admin: bool,
    message_id: String,
) -> Result<(), ChatError> {
    require_admin(is_admin, "delete_message")?;

    let channel = registry.store().message_channel(message_id.clone()).await?;
    let handle = registry.get_or_spawn(channel.clone()).await?;
    handle.soft_delete(message_id.clone()).await?;

    info!(
        component = "moderation",
        event = "moderation.message_deleted",
        channel = %channel,
        message_id = %message_id,
        "Message soft-deleted"
    );
    Ok(())
}

/// Close or reopen a group. Closing neither deletes messages nor disconnects
/// presence; non-admin viewers switch to the closure notice via `GroupUpdated`.
pub async fn set_group_closed(
    registry: &ChannelRegistry,
    is_admin: bool,
    acting_user_id: String,
    group_id: String,
    closed: bool,
    reason: Option<String>,
) -> Result<Group, ChatError> {
    require_admin(is_admin, "set_group_closed")?;

    let handle = registry
        .get_or_spawn(ChannelRef::Group {
            group_id: group_id.clone(),
        })
        .await?;
    let group = handle.set_closed(closed, reason, acting_user_id).await?;

    info!(
        component = "moderation",
        event = "moderation.group_closed",
        group_id = %group_id,
        closed = closed,
        "Group closure state changed"
    );
    Ok(group)
}

/// Destructive and irreversible: drops the group and its entire log.
pub async fn delete_group(
    registry: &ChannelRegistry,
    is_admin: bool,
    group_id: String,
) -> Result<(), ChatError> {
    require_admin(is_admin, "delete_group")?;

    registry.delete_group(group_id.clone()).await?;

    info!(
        component = "moderation",
        event = "moderation.group_deleted",
        group_id = %group_id,
        "Group deleted with cascade"
    );
    Ok(())
}
