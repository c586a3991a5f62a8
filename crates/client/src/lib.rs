//! Stadtchat client library
//!
//! The pieces a frontend needs to drive a chat view: identity resolution
//! (authenticated session or persisted anonymous id), the WebSocket
//! transport with reconnect, the chat view state machine, and the
//! rendering contract.

pub mod controller;
pub mod identity;
pub mod transport;
pub mod view;

pub use controller::{ChatController, SendError, SendOutcome, ViewPhase};
pub use identity::{resolve_actor, AuthSession, IdentityStore};
pub use transport::{Transport, TransportEvent};
pub use view::{report_request_for, ChatMessageData};

/// Client-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),
}
