//! Chat view state machine
//!
//! Drives one channel view: mount (history + subscribe + track), the send
//! path with optimistic echo, live inserts and deletions, presence, group
//! closure, and reconnect reconciliation. Commands go out through the
//! transport's command sink; transport events come back in through
//! `handle_event`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info};

use stadtchat_protocol::{
    Actor, ChannelRef, ClientMessage, Group, ServerMessage, MAX_MESSAGE_CHARS,
};

use crate::transport::TransportEvent;
use crate::view::ChatMessageData;

/// What the view should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewPhase {
    Loading,
    Ready,
    Disconnected,
    Reconnecting,
    /// Non-admin view of a closed group: closure notice, send path refused.
    Closed { reason: Option<String> },
    /// Terminal: the group was deleted (or never existed).
    GroupNotFound,
}

/// Result of an accepted `send`.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Anonymous actor without a saved preference: the send is suspended
    /// until the identity choice is resolved.
    NeedsIdentityChoice,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("message is empty")]
    Empty,
    #[error("message exceeds {MAX_MESSAGE_CHARS} characters")]
    TooLong,
    #[error("a send is already in flight")]
    Busy,
    #[error("group is closed")]
    Closed,
    #[error("view is not ready")]
    NotReady,
}

struct PendingSend {
    row: ChatMessageData,
    sent_at: Instant,
}

pub struct ChatController {
    channel: ChannelRef,
    actor: Actor,
    is_admin: bool,
    /// Saved "stay anonymous" preference; without it an anonymous send
    /// surfaces the identity choice first.
    stay_anonymous: bool,
    commands: mpsc::Sender<ClientMessage>,

    phase: ViewPhase,
    messages: Vec<ChatMessageData>,
    pending: HashMap<String, PendingSend>,
    suspended: Option<String>,
    presence_count: u32,
    presence: Vec<Actor>,
    group_closed: bool,
    closed_reason: Option<String>,
}

impl ChatController {
    /// `group` seeds closure state for a group view; pass `None` for the
    /// global channel.
    pub fn new(
        channel: ChannelRef,
        actor: Actor,
        is_admin: bool,
        stay_anonymous: bool,
        group: Option<&Group>,
        commands: mpsc::Sender<ClientMessage>,
    ) -> Self {
        let group_closed = group.map(|g| g.is_closed).unwrap_or(false);
        let closed_reason = group.and_then(|g| g.closed_reason.clone());

        Self {
            channel,
            actor,
            is_admin,
            stay_anonymous,
            commands,
            phase: ViewPhase::Loading,
            messages: Vec::new(),
            pending: HashMap::new(),
            suspended: None,
            presence_count: 0,
            presence: Vec::new(),
            group_closed,
            closed_reason,
        }
    }

    pub fn phase(&self) -> &ViewPhase {
        &self.phase
    }

    pub fn presence_count(&self) -> u32 {
        self.presence_count
    }

    pub fn presence(&self) -> &[Actor] {
        &self.presence
    }

    /// Authoritative rows followed by optimistic pending rows.
    pub fn rows(&self) -> Vec<ChatMessageData> {
        let mut rows = self.messages.clone();
        rows.extend(self.pending.values().map(|p| p.row.clone()));
        rows
    }

    /// Feed one transport event through the state machine.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        if self.phase == ViewPhase::GroupNotFound {
            return;
        }

        match event {
            TransportEvent::Connected => {
                if self.phase == ViewPhase::Disconnected {
                    self.phase = ViewPhase::Reconnecting;
                }
                // History is refetched on every (re)connect to reconcile
                // anything missed while the socket was down.
                self.mount().await;
            }
            TransportEvent::Disconnected => {
                self.phase = ViewPhase::Disconnected;
            }
            TransportEvent::Message(msg) => self.handle_server_message(msg).await,
        }
    }

    async fn mount(&mut self) {
        let _ = self
            .commands
            .send(ClientMessage::FetchHistory {
                channel: self.channel.clone(),
                limit: None,
            })
            .await;
        let _ = self
            .commands
            .send(ClientMessage::Subscribe {
                channel: self.channel.clone(),
            })
            .await;
    }

    async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Subscribed { channel } if channel == self.channel => {
                // Presence is announced only once the subscription is live.
                let _ = self
                    .commands
                    .send(ClientMessage::Track {
                        channel: self.channel.clone(),
                    })
                    .await;
            }
            ServerMessage::History { channel, messages } if channel == self.channel => {
                self.messages = messages
                    .iter()
                    .map(|m| ChatMessageData::from_message(m, &self.actor, self.is_admin))
                    .collect();
                self.enter_live();
            }
            ServerMessage::MessageInserted {
                channel,
                message,
                correlation_id,
            } if channel == self.channel => {
                if let Some(cid) = correlation_id {
                    if self.pending.remove(&cid).is_some() {
                        debug!(
                            component = "controller",
                            event = "controller.pending_reconciled",
                            message_id = %message.id,
                            "Optimistic entry replaced by authoritative insert"
                        );
                    }
                }
                // At-least-once delivery: drop anything already rendered.
                if self.messages.iter().any(|m| m.id == message.id) {
                    return;
                }
                self.messages.push(ChatMessageData::from_message(
                    &message,
                    &self.actor,
                    self.is_admin,
                ));
            }
            ServerMessage::MessageUpdated {
                channel,
                message_id,
                is_deleted,
            } if channel == self.channel => {
                if is_deleted {
                    self.messages.retain(|m| m.id != message_id);
                }
            }
            ServerMessage::PresenceSync {
                channel,
                count,
                actors,
            } if channel == self.channel => {
                self.presence_count = count;
                self.presence = actors;
            }
            ServerMessage::GroupUpdated { group }
                if self.channel.group_id() == Some(group.id.as_str()) =>
            {
                self.group_closed = group.is_closed;
                self.closed_reason = group.closed_reason.clone();
                if group.is_closed && !self.is_admin {
                    info!(
                        component = "controller",
                        event = "controller.group_closed",
                        group_id = %group.id,
                        "Group closed, switching to closure notice"
                    );
                    self.phase = ViewPhase::Closed {
                        reason: group.closed_reason,
                    };
                } else if !group.is_closed && matches!(self.phase, ViewPhase::Closed { .. }) {
                    self.phase = ViewPhase::Ready;
                }
            }
            ServerMessage::GroupDeleted { group_id }
                if self.channel.group_id() == Some(group_id.as_str()) =>
            {
                self.phase = ViewPhase::GroupNotFound;
            }
            ServerMessage::Error { code, channel, .. }
                if channel.as_ref() == Some(&self.channel) =>
            {
                match code.as_str() {
                    "not_found" => self.phase = ViewPhase::GroupNotFound,
                    // Fan-out gap: refetch for a consistent view.
                    "lagged" => {
                        let _ = self
                            .commands
                            .send(ClientMessage::FetchHistory {
                                channel: self.channel.clone(),
                                limit: None,
                            })
                            .await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn enter_live(&mut self) {
        self.phase = if self.group_closed && !self.is_admin {
            ViewPhase::Closed {
                reason: self.closed_reason.clone(),
            }
        } else {
            ViewPhase::Ready
        };
    }

    /// Validate and send a message. Boundary violations never leave the
    /// client; at most one send is in flight at a time.
    pub async fn send(&mut self, content: &str) -> Result<SendOutcome, SendError> {
        if content.trim().is_empty() {
            return Err(SendError::Empty);
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(SendError::TooLong);
        }
        if self.group_closed && !self.is_admin {
            return Err(SendError::Closed);
        }
        if self.phase != ViewPhase::Ready {
            return Err(SendError::NotReady);
        }
        if !self.pending.is_empty() {
            return Err(SendError::Busy);
        }

        if self.actor.is_anonymous() && !self.stay_anonymous {
            self.suspended = Some(content.to_string());
            return Ok(SendOutcome::NeedsIdentityChoice);
        }

        self.dispatch_send(content.to_string()).await;
        Ok(SendOutcome::Sent)
    }

    /// Resolve the identity choice in favor of staying anonymous and flush
    /// the suspended send. Persisting the preference is the caller's job
    /// (via `IdentityStore::set_stay_anonymous`).
    pub async fn confirm_stay_anonymous(&mut self) {
        self.stay_anonymous = true;
        if let Some(content) = self.suspended.take() {
            self.dispatch_send(content).await;
        }
    }

    async fn dispatch_send(&mut self, content: String) {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        self.pending.insert(
            correlation_id.clone(),
            PendingSend {
                row: ChatMessageData {
                    id: format!("pending-{correlation_id}"),
                    nickname: self.actor.nickname().to_string(),
                    message: content.clone(),
                    timestamp: Local::now().format("%H:%M").to_string(),
                    is_own: true,
                    is_admin: self.is_admin,
                },
                sent_at: Instant::now(),
            },
        );

        let _ = self
            .commands
            .send(ClientMessage::SendMessage {
                channel: self.channel.clone(),
                content,
                correlation_id: Some(correlation_id),
            })
            .await;
    }

    /// Drop optimistic entries whose authoritative echo never arrived. The
    /// send slot frees up and the user can retry.
    pub fn prune_pending(&mut self, timeout: Duration) {
        self.pending.retain(|_, p| p.sent_at.elapsed() < timeout);
    }
}
