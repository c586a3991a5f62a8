//! Message Store — SQLite source of truth for channel logs and groups.
//!
//! All SQLite access goes through `spawn_blocking`. Write serialization per
//! channel happens at the channel actor, which is the store's single writer
//! for a given log; the store itself only enforces row-level invariants
//! (content bounds, soft delete, group cascade).

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use stadtchat_protocol::{new_id, Actor, ChannelRef, ChatMessage, Group, MAX_MESSAGE_CHARS};

use crate::error::ChatError;

/// History cap applied when the client does not ask for one. Both the global
/// channel and group channels are capped; unbounded fetches are not offered.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Handle to the chat database. Cheap to clone; each operation opens its own
/// connection (WAL mode, busy timeout) inside a blocking task.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    pub async fn fetch_history(
        &self,
        channel: ChannelRef,
        limit: Option<u32>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        self.blocking(move |conn| fetch_history_blocking(conn, &channel, limit))
            .await
    }

    pub async fn append(
        &self,
        channel: ChannelRef,
        actor: Actor,
        content: String,
    ) -> Result<ChatMessage, ChatError> {
        self.blocking(move |conn| append_blocking(conn, &channel, &actor, &content))
            .await
    }

    /// Flip `is_deleted` on a message, leaving the row for audit. Returns the
    /// channel the message belongs to so the fan-out can route the update.
    pub async fn mark_deleted(&self, message_id: String) -> Result<ChannelRef, ChatError> {
        self.blocking(move |conn| mark_deleted_blocking(conn, &message_id))
            .await
    }

    /// Look up which channel a message belongs to without mutating it.
    pub async fn message_channel(&self, message_id: String) -> Result<ChannelRef, ChatError> {
        self.blocking(move |conn| message_channel_blocking(conn, &message_id))
            .await
    }

    pub async fn create_group(
        &self,
        name: String,
        description: String,
        creator_user_id: String,
    ) -> Result<Group, ChatError> {
        self.blocking(move |conn| create_group_blocking(conn, &name, &description, &creator_user_id))
            .await
    }

    pub async fn get_group(&self, group_id: String) -> Result<Option<Group>, ChatError> {
        self.blocking(move |conn| get_group_blocking(conn, &group_id))
            .await
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, ChatError> {
        self.blocking(list_groups_blocking).await
    }

    pub async fn set_group_closed(
        &self,
        group_id: String,
        closed: bool,
        reason: Option<String>,
        closed_by: Option<String>,
    ) -> Result<Group, ChatError> {
        self.blocking(move |conn| {
            set_group_closed_blocking(conn, &group_id, closed, reason.as_deref(), closed_by.as_deref())
        })
        .await
    }

    /// Destructive and irreversible: removes the group row and every message
    /// in its channel.
    pub async fn delete_group(&self, group_id: String) -> Result<(), ChatError> {
        self.blocking(move |conn| delete_group_blocking(conn, &group_id))
            .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ChatError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ChatError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            f(&conn)
        })
        .await
        .map_err(|e| ChatError::ChannelUnavailable(format!("storage task failed: {e}")))?
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, ChatError> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Reject empty (after trim) and oversized content before it reaches the log.
pub fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message is empty".to_string()));
    }
    let chars = content.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ChatError::Validation(format!(
            "message is {chars} characters, maximum is {MAX_MESSAGE_CHARS}"
        )));
    }
    Ok(())
}

fn fetch_history_blocking(
    conn: &Connection,
    channel: &ChannelRef,
    limit: Option<u32>,
) -> Result<Vec<ChatMessage>, ChatError> {
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    // Newest `limit` rows, returned ascending by commit order.
    let mut stmt = conn.prepare(
        "SELECT id, seq, content, display_nickname, actor_user_id, is_anonymous, is_deleted, created_at
         FROM (
             SELECT * FROM messages
             WHERE channel = ?1 AND is_deleted = 0
             ORDER BY seq DESC
             LIMIT ?2
         )
         ORDER BY seq ASC",
    )?;

    let messages = stmt
        .query_map(params![channel.to_string(), limit], |row| {
            row_to_message(row, channel.clone())
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

fn append_blocking(
    conn: &Connection,
    channel: &ChannelRef,
    actor: &Actor,
    content: &str,
) -> Result<ChatMessage, ChatError> {
    validate_content(content)?;

    let seq: u64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE channel = ?1",
        params![channel.to_string()],
        |row| row.get(0),
    )?;

    let message = ChatMessage {
        id: new_id(),
        channel: channel.clone(),
        seq,
        content: content.to_string(),
        display_nickname: actor.nickname().to_string(),
        actor_user_id: actor.user_id().map(str::to_string),
        is_anonymous: actor.is_anonymous(),
        is_deleted: false,
        created_at: now_iso8601(),
    };

    let anonymous_id = match actor {
        Actor::Anonymous { anonymous_id, .. } => Some(anonymous_id.as_str()),
        Actor::Authenticated { .. } => None,
    };

    conn.execute(
        "INSERT INTO messages (id, channel, seq, content, display_nickname, actor_user_id, anonymous_id, is_anonymous, is_deleted, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
        params![
            message.id,
            channel.to_string(),
            seq,
            message.content,
            message.display_nickname,
            message.actor_user_id,
            anonymous_id,
            message.is_anonymous,
            message.created_at,
        ],
    )?;

    Ok(message)
}

fn mark_deleted_blocking(conn: &Connection, message_id: &str) -> Result<ChannelRef, ChatError> {
    let channel = message_channel_blocking(conn, message_id)?;
    conn.execute(
        "UPDATE messages SET is_deleted = 1 WHERE id = ?1",
        params![message_id],
    )?;
    Ok(channel)
}

fn message_channel_blocking(conn: &Connection, message_id: &str) -> Result<ChannelRef, ChatError> {
    let key: Option<String> = conn
        .query_row(
            "SELECT channel FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .optional()?;

    let key = key.ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
    channel_from_key(&key)
        .ok_or_else(|| ChatError::ChannelUnavailable(format!("bad channel key {key}")))
}

fn create_group_blocking(
    conn: &Connection,
    name: &str,
    description: &str,
    creator_user_id: &str,
) -> Result<Group, ChatError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::Validation("group name is empty".to_string()));
    }

    let group = Group {
        id: new_id(),
        name: name.to_string(),
        description: description.to_string(),
        creator: Actor::Authenticated {
            user_id: creator_user_id.to_string(),
        },
        is_closed: false,
        closed_reason: None,
        closed_by: None,
        created_at: now_iso8601(),
    };

    conn.execute(
        "INSERT INTO groups (id, name, description, creator_user_id, is_closed, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            group.id,
            group.name,
            group.description,
            creator_user_id,
            group.created_at
        ],
    )?;

    Ok(group)
}

fn get_group_blocking(conn: &Connection, group_id: &str) -> Result<Option<Group>, ChatError> {
    let group = conn
        .query_row(
            "SELECT id, name, description, creator_user_id, is_closed, closed_reason, closed_by, created_at
             FROM groups WHERE id = ?1",
            params![group_id],
            row_to_group,
        )
        .optional()?;
    Ok(group)
}

fn list_groups_blocking(conn: &Connection) -> Result<Vec<Group>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, creator_user_id, is_closed, closed_reason, closed_by, created_at
         FROM groups ORDER BY created_at ASC",
    )?;
    let groups = stmt
        .query_map([], row_to_group)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(groups)
}

fn set_group_closed_blocking(
    conn: &Connection,
    group_id: &str,
    closed: bool,
    reason: Option<&str>,
    closed_by: Option<&str>,
) -> Result<Group, ChatError> {
    let updated = if closed {
        conn.execute(
            "UPDATE groups SET is_closed = 1, closed_reason = ?2, closed_by = ?3 WHERE id = ?1",
            params![group_id, reason, closed_by],
        )?
    } else {
        conn.execute(
            "UPDATE groups SET is_closed = 0, closed_reason = NULL, closed_by = NULL WHERE id = ?1",
            params![group_id],
        )?
    };

    if updated == 0 {
        return Err(ChatError::NotFound(format!("group {group_id}")));
    }

    get_group_blocking(conn, group_id)?
        .ok_or_else(|| ChatError::NotFound(format!("group {group_id}")))
}

fn delete_group_blocking(conn: &Connection, group_id: &str) -> Result<(), ChatError> {
    let channel = ChannelRef::Group {
        group_id: group_id.to_string(),
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM messages WHERE channel = ?1",
        params![channel.to_string()],
    )?;
    let removed = tx.execute("DELETE FROM groups WHERE id = ?1", params![group_id])?;
    tx.commit()?;

    if removed == 0 {
        return Err(ChatError::NotFound(format!("group {group_id}")));
    }
    Ok(())
}

fn row_to_message(
    row: &rusqlite::Row<'_>,
    channel: ChannelRef,
) -> Result<ChatMessage, rusqlite::Error> {
    Ok(ChatMessage {
        id: row.get(0)?,
        channel,
        seq: row.get(1)?,
        content: row.get(2)?,
        display_nickname: row.get(3)?,
        actor_user_id: row.get(4)?,
        is_anonymous: row.get(5)?,
        is_deleted: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> Result<Group, rusqlite::Error> {
    let creator_user_id: String = row.get(3)?;
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        creator: Actor::Authenticated {
            user_id: creator_user_id,
        },
        is_closed: row.get(4)?,
        closed_reason: row.get(5)?,
        closed_by: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Parse a stored channel key (`global` or `group:<id>`).
fn channel_from_key(key: &str) -> Option<ChannelRef> {
    if key == "global" {
        return Some(ChannelRef::Global);
    }
    key.strip_prefix("group:").map(|id| ChannelRef::Group {
        group_id: id.to_string(),
    })
}

/// Current time as an ISO 8601 string.
pub(crate) fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    time_to_iso8601(secs)
}

fn time_to_iso8601(secs: u64) -> String {
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;

    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut days = days_since_epoch as i64;
    let mut year = 1970i64;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let mut month = 1;
    let days_in_months = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    for days_in_month in days_in_months {
        if days < days_in_month {
            break;
        }
        days -= days_in_month;
        month += 1;
    }

    let day = days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
