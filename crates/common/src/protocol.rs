// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Message types exchanged between clipboard clients and the relay.
//!
//! JSON envelopes are internally tagged on `"type"`. Image payloads either ride inside a JSON
//! envelope as base64 (or a `data:image/...;base64,` URL) or in a binary frame whose layout is
//! described in [`crate::codec`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identity the relay assigns to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipboardKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardContent {
    Text(String),
    Image {
        /// Short image format name, e.g. `png`, when the sender declared one.
        format: Option<String>,
        bytes: Bytes,
    },
}

/// How a payload arrived, so it can leave the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadTransport {
    Json,
    Binary,
}

/// A single clipboard update, as relayed between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardMessage {
    pub content: ClipboardContent,
    /// Set by the relay on receipt; never trusted from the wire.
    pub origin: Option<ConnectionId>,
    pub transport: PayloadTransport,
}

impl ClipboardMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: ClipboardContent::Text(text.into()),
            origin: None,
            transport: PayloadTransport::Json,
        }
    }

    /// An image payload, framed as binary on the wire.
    pub fn image(format: Option<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content: ClipboardContent::Image {
                format,
                bytes: bytes.into(),
            },
            origin: None,
            transport: PayloadTransport::Binary,
        }
    }

    pub fn with_origin(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_transport(mut self, transport: PayloadTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn kind(&self) -> ClipboardKind {
        match self.content {
            ClipboardContent::Text(_) => ClipboardKind::Text,
            ClipboardContent::Image { .. } => ClipboardKind::Image,
        }
    }

    /// Size of the decoded payload in bytes.
    pub fn size_bytes(&self) -> usize {
        match &self.content {
            ClipboardContent::Text(text) => text.len(),
            ClipboardContent::Image { bytes, .. } => bytes.len(),
        }
    }
}

/// Messages a client may send as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default, alias = "user_id")]
        username: String,
        #[serde(default)]
        password: String,
    },
    Clipboard {
        kind: ClipboardKind,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    /// Older clients send both fields and leave the unused one empty.
    ClipboardUpdate {
        #[serde(default)]
        text: String,
        #[serde(default)]
        image: String,
    },
    Ping,
}

/// Messages the relay sends as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        reason: String,
    },
    Pong,
    Clipboard {
        kind: ClipboardKind,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        /// Username of the sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
}

impl ServerMessage {
    pub fn auth_accepted(message: impl Into<String>) -> Self {
        ServerMessage::AuthResult {
            success: true,
            reason: None,
            message: Some(message.into()),
        }
    }

    pub fn auth_rejected(reason: impl Into<String>) -> Self {
        ServerMessage::AuthResult {
            success: false,
            reason: Some(reason.into()),
            message: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Error {
            reason: reason.into(),
        }
    }
}

/// JSON header of a binary image frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryHeader {
    #[serde(rename = "type")]
    pub message_type: String,
    pub kind: ClipboardKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}
