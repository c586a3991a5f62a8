//! WebSocket handling
//!
//! One socket per client. The first message must be `Hello`; after that the
//! connection can hold any number of channel subscriptions, each backed by a
//! broadcast-forwarder task draining the channel actor's fan-out into this
//! socket's outbound queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        RawQuery, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use stadtchat_protocol::{Actor, ChannelRef, ClientMessage, ServerMessage};

use crate::auth::{Account, AccountRegistry};
use crate::channel::ChannelHandle;
use crate::error::ChatError;
use crate::moderation;
use crate::registry::ChannelRegistry;

/// Shared state behind the `/ws` route.
pub struct HubState {
    pub registry: ChannelRegistry,
    pub accounts: AccountRegistry,
}

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let account = AccountRegistry::token_from_query(query.as_deref())
        .and_then(|token| state.accounts.resolve(token))
        .cloned();

    ws.on_upgrade(move |socket| handle_socket(socket, state, account))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<HubState>, account: Option<Account>) {
    let connection_id = state.registry.allocate_connection_id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = connection_id,
        authenticated = account.is_some(),
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Channel for sending messages to this client
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut conn = Connection {
        connection_id,
        actor: None,
        is_admin: false,
        subscriptions: HashMap::new(),
        tracked: HashSet::new(),
        outbound: outbound_tx.clone(),
        account,
    };

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = connection_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = connection_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = connection_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                conn.send(ServerMessage::Error {
                    code: "parse_error".into(),
                    message: e.to_string(),
                    channel: None,
                })
                .await;
                continue;
            }
        };

        conn.handle_message(&state, client_msg).await;
    }

    // Teardown: presence leaves and forwarders die with the socket.
    conn.teardown().await;

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = connection_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Per-socket session state.
struct Connection {
    connection_id: u64,
    actor: Option<Actor>,
    is_admin: bool,
    subscriptions: HashMap<ChannelRef, (ChannelHandle, JoinHandle<()>)>,
    tracked: HashSet<ChannelRef>,
    outbound: mpsc::Sender<OutboundMessage>,
    account: Option<Account>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(OutboundMessage::Json(msg)).await;
    }

    async fn send_error(&self, err: &ChatError, channel: Option<ChannelRef>) {
        self.send(err.to_server_message(channel)).await;
    }

    /// The established actor, or a `permission` error before `Hello`.
    fn established(&self) -> Result<Actor, ChatError> {
        self.actor
            .clone()
            .ok_or_else(|| ChatError::Permission("send hello first".to_string()))
    }

    async fn handle_message(&mut self, state: &Arc<HubState>, msg: ClientMessage) {
        // Everything except Hello requires an established actor.
        if !matches!(msg, ClientMessage::Hello { .. }) {
            if let Err(e) = self.established() {
                self.send_error(&e, None).await;
                return;
            }
        }

        match msg {
            ClientMessage::Hello { actor } => self.handle_hello(actor).await,
            ClientMessage::Subscribe { channel } => self.handle_subscribe(state, channel).await,
            ClientMessage::Unsubscribe { channel } => self.handle_unsubscribe(channel).await,
            ClientMessage::Track { channel } => self.handle_track(channel).await,
            ClientMessage::FetchHistory { channel, limit } => {
                self.handle_fetch_history(state, channel, limit).await
            }
            ClientMessage::SendMessage {
                channel,
                content,
                correlation_id,
            } => {
                self.handle_send_message(state, channel, content, correlation_id)
                    .await
            }
            ClientMessage::CreateGroup { name, description } => {
                self.handle_create_group(state, name, description).await
            }
            ClientMessage::ListGroups => self.handle_list_groups(state).await,
            ClientMessage::DeleteMessage { message_id } => {
                let result =
                    moderation::delete_message(&state.registry, self.is_admin, message_id).await;
                if let Err(e) = result {
                    self.send_error(&e, None).await;
                }
            }
            ClientMessage::SetGroupClosed {
                group_id,
                closed,
                reason,
            } => {
                self.handle_set_group_closed(state, group_id, closed, reason)
                    .await
            }
            ClientMessage::DeleteGroup { group_id } => {
                let result =
                    moderation::delete_group(&state.registry, self.is_admin, group_id).await;
                if let Err(e) = result {
                    self.send_error(&e, None).await;
                }
            }
        }
    }

    async fn handle_hello(&mut self, declared: Actor) {
        // The actor is fixed for the connection's lifetime; presence entries
        // are keyed under it and must not be swapped mid-session.
        if self.actor.is_some() {
            let err = ChatError::Validation("actor is already established".to_string());
            self.send_error(&err, None).await;
            return;
        }

        // A valid token is authoritative over whatever the client declared.
        let actor = match &self.account {
            Some(account) => {
                self.is_admin = account.is_admin;
                Actor::Authenticated {
                    user_id: account.user_id.clone(),
                }
            }
            None => {
                if !declared.is_anonymous() {
                    let err = ChatError::Permission(
                        "authenticated identity requires a valid token".to_string(),
                    );
                    self.send_error(&err, None).await;
                    return;
                }
                declared
            }
        };

        info!(
            component = "websocket",
            event = "ws.hello",
            connection_id = self.connection_id,
            nickname = %actor.nickname(),
            is_admin = self.is_admin,
            "Connection actor established"
        );

        self.actor = Some(actor.clone());
        self.send(ServerMessage::Welcome {
            actor,
            is_admin: self.is_admin,
        })
        .await;
    }

    async fn handle_subscribe(&mut self, state: &Arc<HubState>, channel: ChannelRef) {
        if let Err(e) = self.established() {
            self.send_error(&e, Some(channel)).await;
            return;
        }

        // Re-subscribing an open channel just re-confirms activation.
        if self.subscriptions.contains_key(&channel) {
            self.send(ServerMessage::Subscribed { channel }).await;
            return;
        }

        let handle = match state.registry.get_or_spawn(channel.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.send_error(&e, Some(channel)).await;
                return;
            }
        };

        let rx = match handle.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                self.send_error(&e, Some(channel)).await;
                return;
            }
        };

        let forwarder = spawn_broadcast_forwarder(rx, self.outbound.clone(), channel.clone());
        self.subscriptions
            .insert(channel.clone(), (handle, forwarder));
        self.send(ServerMessage::Subscribed { channel }).await;
    }

    async fn handle_unsubscribe(&mut self, channel: ChannelRef) {
        // Idempotent: unknown channels are a no-op.
        if let Some((handle, forwarder)) = self.subscriptions.remove(&channel) {
            forwarder.abort();
            if self.tracked.remove(&channel) {
                let _ = handle.untrack(self.connection_id).await;
            }
        }
    }

    async fn handle_track(&mut self, channel: ChannelRef) {
        let actor = match self.established() {
            Ok(actor) => actor,
            Err(e) => {
                self.send_error(&e, Some(channel)).await;
                return;
            }
        };

        // Presence piggybacks on an active subscription, never precedes it.
        let Some((handle, _)) = self.subscriptions.get(&channel) else {
            let err = ChatError::Validation("track requires an active subscription".to_string());
            self.send_error(&err, Some(channel)).await;
            return;
        };

        if let Err(e) = handle.track(self.connection_id, actor).await {
            self.send_error(&e, Some(channel)).await;
            return;
        }
        self.tracked.insert(channel);
    }

    async fn handle_fetch_history(
        &mut self,
        state: &Arc<HubState>,
        channel: ChannelRef,
        limit: Option<u32>,
    ) {
        if let Err(e) = self.established() {
            self.send_error(&e, Some(channel)).await;
            return;
        }

        let result = match state.registry.get_or_spawn(channel.clone()).await {
            Ok(handle) => handle.fetch_history(limit).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(messages) => {
                self.send(ServerMessage::History { channel, messages }).await;
            }
            Err(e) => self.send_error(&e, Some(channel)).await,
        }
    }

    async fn handle_send_message(
        &mut self,
        state: &Arc<HubState>,
        channel: ChannelRef,
        content: String,
        correlation_id: Option<String>,
    ) {
        let actor = match self.established() {
            Ok(actor) => actor,
            Err(e) => {
                self.send_error(&e, Some(channel)).await;
                return;
            }
        };

        let result = match state.registry.get_or_spawn(channel.clone()).await {
            Ok(handle) => {
                handle
                    .append(actor, self.is_admin, content, correlation_id)
                    .await
            }
            Err(e) => Err(e),
        };

        // Success needs no direct reply: the fan-out echoes the insert to
        // this connection's own subscription, correlation id included.
        if let Err(e) = result {
            self.send_error(&e, Some(channel)).await;
        }
    }

    async fn handle_create_group(
        &mut self,
        state: &Arc<HubState>,
        name: String,
        description: String,
    ) {
        let actor = match self.established() {
            Ok(actor) => actor,
            Err(e) => {
                self.send_error(&e, None).await;
                return;
            }
        };

        match state.registry.create_group(&actor, name, description).await {
            Ok(group) => self.send(ServerMessage::GroupCreated { group }).await,
            Err(e) => self.send_error(&e, None).await,
        }
    }

    async fn handle_list_groups(&mut self, state: &Arc<HubState>) {
        match state.registry.list_groups().await {
            Ok(groups) => self.send(ServerMessage::GroupsList { groups }).await,
            Err(e) => self.send_error(&e, None).await,
        }
    }

    async fn handle_set_group_closed(
        &mut self,
        state: &Arc<HubState>,
        group_id: String,
        closed: bool,
        reason: Option<String>,
    ) {
        let acting_user_id = self
            .actor
            .as_ref()
            .and_then(|a| a.user_id())
            .unwrap_or("")
            .to_string();

        let result = moderation::set_group_closed(
            &state.registry,
            self.is_admin,
            acting_user_id,
            group_id,
            closed,
            reason,
        )
        .await;

        if let Err(e) = result {
            self.send_error(&e, None).await;
        }
    }

    /// Socket teardown is the synchronous unsubscribe: every tracked channel
    /// sees the presence leave, every forwarder is aborted.
    async fn teardown(&mut self) {
        for (channel, (handle, forwarder)) in self.subscriptions.drain() {
            forwarder.abort();
            if self.tracked.remove(&channel) {
                let _ = handle.untrack(self.connection_id).await;
            }
        }
    }
}

/// Spawn a task that drains a broadcast receiver and forwards events to the
/// outbound channel. When the outbound channel closes (client disconnect),
/// the task exits and the broadcast::Receiver is dropped.
///
/// If the subscriber lags behind the broadcast buffer, a `lagged` error is
/// sent so the client can refetch history for a fresh view.
fn spawn_broadcast_forwarder(
    mut rx: tokio::sync::broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    channel: ChannelRef,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        channel = %channel,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "lagged".to_string(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                            channel: Some(channel.clone()),
                        }))
                        .await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
