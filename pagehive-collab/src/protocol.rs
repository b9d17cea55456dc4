//! JSON event protocol spoken over the page WebSocket.
//!
//! Wire format (one UTF-8 text frame per event):
//! ```text
//! { "event": "content-update", "data": { "room": "page-1", "content": { … } } }
//! ```
//!
//! Client → server: `join-room`, `leave-room`, `cursor-update`, `content-update`.
//! Server → client: `user-joined`, `user-left`, `cursor-update`, `content-update`,
//! `notification:new`, `connect-error`.
//!
//! The legacy editor emits `join-page`/`leave-page` with a bare page id and keys
//! room-scoped payloads by `pageId`; both spellings decode to the same events.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

use crate::notify::Notification;

/// A pre-encoded server event, shared between all recipients of a fan-out.
pub type Frame = Utf8Bytes;

/// Opaque user identifier, resolved once per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast scope, keyed by page identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for one live connection. Distinct from the identity behind it:
/// one user may hold several connections (tabs, devices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Authenticated user bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: IdentityId::new(id),
            name: name.into(),
        }
    }
}

/// Room reference as sent by join/leave: either `{ "room": … }` or a bare id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum RoomRef {
    Bare(RoomId),
    Object {
        #[serde(alias = "pageId")]
        room: RoomId,
    },
}

impl From<RoomRef> for RoomId {
    fn from(r: RoomRef) -> Self {
        match r {
            RoomRef::Bare(room) | RoomRef::Object { room } => room,
        }
    }
}

/// Events a client may send once authenticated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
enum WireClientEvent {
    #[serde(rename = "join-room", alias = "join-page")]
    JoinRoom(RoomRef),
    #[serde(rename = "leave-room", alias = "leave-page")]
    LeaveRoom(RoomRef),
    #[serde(rename = "cursor-update")]
    CursorUpdate {
        #[serde(alias = "pageId")]
        room: RoomId,
        position: Value,
    },
    #[serde(rename = "content-update")]
    ContentUpdate {
        #[serde(alias = "pageId")]
        room: RoomId,
        content: Value,
    },
}

/// Decoded client → server event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom { room: RoomId },
    LeaveRoom { room: RoomId },
    /// Fire-and-forget cursor position; never persisted.
    CursorUpdate { room: RoomId, position: Value },
    ContentUpdate { room: RoomId, content: Value },
}

impl ClientEvent {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireClientEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(match wire {
            WireClientEvent::JoinRoom(r) => Self::JoinRoom { room: r.into() },
            WireClientEvent::LeaveRoom(r) => Self::LeaveRoom { room: r.into() },
            WireClientEvent::CursorUpdate { room, position } => {
                Self::CursorUpdate { room, position }
            }
            WireClientEvent::ContentUpdate { room, content } => {
                Self::ContentUpdate { room, content }
            }
        })
    }

    /// Encode in canonical form (used by clients and tests).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::JoinRoom { room } => {
                serde_json::json!({ "event": "join-room", "data": { "room": room } })
            }
            Self::LeaveRoom { room } => {
                serde_json::json!({ "event": "leave-room", "data": { "room": room } })
            }
            Self::CursorUpdate { room, position } => serde_json::json!({
                "event": "cursor-update",
                "data": { "room": room, "position": position },
            }),
            Self::ContentUpdate { room, content } => serde_json::json!({
                "event": "content-update",
                "data": { "room": room, "content": content },
            }),
        };
        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Room this event targets.
    pub fn room(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room }
            | Self::LeaveRoom { room }
            | Self::CursorUpdate { room, .. }
            | Self::ContentUpdate { room, .. } => room,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::CursorUpdate { .. } => "cursor-update",
            Self::ContentUpdate { .. } => "content-update",
        }
    }
}

/// Server → client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user-joined")]
    UserJoined {
        #[serde(rename = "userId")]
        user_id: IdentityId,
    },
    #[serde(rename = "user-left")]
    UserLeft {
        #[serde(rename = "userId")]
        user_id: IdentityId,
    },
    #[serde(rename = "cursor-update")]
    CursorUpdate {
        #[serde(rename = "userId")]
        user_id: IdentityId,
        position: Value,
    },
    #[serde(rename = "content-update")]
    ContentUpdate {
        #[serde(rename = "userId")]
        user_id: IdentityId,
        content: Value,
    },
    #[serde(rename = "notification:new")]
    NotificationNew(Notification),
    /// Sent once before the server closes a rejected connection.
    #[serde(rename = "connect-error")]
    ConnectError { reason: String, message: String },
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Encode into a shareable frame for fan-out.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        self.encode().map(Frame::from)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
