//! WebSocket transport with reconnect
//!
//! Owns the socket on a background task and exposes two channels: an event
//! stream (connected / server message / disconnected) and a command sink.
//! On disconnect the task retries with capped exponential backoff; the
//! controller sees a `Disconnected` event and reconciles on `Connected`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use stadtchat_protocol::{ClientMessage, ServerMessage};

use crate::ClientError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Events surfaced to the controller.
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket is open; the controller re-runs its mount sequence.
    Connected,
    Message(ServerMessage),
    Disconnected,
}

/// Handle to the background connection task.
#[derive(Debug)]
pub struct Transport {
    pub events: mpsc::Receiver<TransportEvent>,
    pub commands: mpsc::Sender<ClientMessage>,
}

impl Transport {
    /// Connect to a Stadtchat server, e.g. `ws://127.0.0.1:4600/ws` (append
    /// `?token=<token>` for an authenticated connection). A malformed URL is
    /// rejected up front; the returned handle is live immediately and
    /// `Connected` arrives once the socket is open.
    pub fn connect(url: String) -> Result<Self, ClientError> {
        url.as_str()
            .into_client_request()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(100);
        let (command_tx, command_rx) = mpsc::channel::<ClientMessage>(100);

        tokio::spawn(run_connection(url, event_tx, command_rx));

        Ok(Self {
            events: event_rx,
            commands: command_tx,
        })
    }
}

async fn run_connection(
    url: String,
    event_tx: mpsc::Sender<TransportEvent>,
    mut command_rx: mpsc::Receiver<ClientMessage>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let (ws, _) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(
                    component = "transport",
                    event = "transport.connect_failed",
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Connection attempt failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        info!(
            component = "transport",
            event = "transport.connected",
            "WebSocket connected"
        );
        backoff = INITIAL_BACKOFF;
        if event_tx.send(TransportEvent::Connected).await.is_err() {
            return;
        }

        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Controller dropped the handle; close and stop.
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    };
                    let json = match serde_json::to_string(&cmd) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(
                                component = "transport",
                                event = "transport.serialize_failed",
                                error = %e,
                                "Failed to serialize command"
                            );
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(msg) => {
                                    if event_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        component = "transport",
                                        event = "transport.parse_failed",
                                        error = %e,
                                        "Failed to parse server message"
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(
                                component = "transport",
                                event = "transport.read_error",
                                error = %e,
                                "WebSocket read error"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            component = "transport",
            event = "transport.disconnected",
            "WebSocket disconnected, will reconnect"
        );
        if event_tx.send(TransportEvent::Disconnected).await.is_err() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
