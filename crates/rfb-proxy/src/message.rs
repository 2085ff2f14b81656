//! Typed RFB messages as they appear on the post-handshake stream.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Which way a byte stream flows through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client_to_server",
            Self::ServerToClient => "server_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol message.
///
/// File-transfer messages (tag 7 in both directions) are a local convention
/// layered on top of standard RFB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ---- client -> server ----
    SetPixelFormat,
    SetEncodings {
        count: u16,
    },
    FramebufferUpdateRequest {
        incremental: bool,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    KeyEvent {
        down: bool,
        key: u32,
    },
    PointerEvent {
        buttons: u8,
        x: u16,
        y: u16,
    },
    ClientCutText {
        text: String,
    },
    FileTransferRequest {
        file_name: String,
        size: u32,
        payload: Bytes,
    },

    // ---- server -> client ----
    /// Wire length is approximated: rectangle payloads are not parsed.
    FramebufferUpdate {
        rectangle_count: u16,
        approx_len: usize,
    },
    SetColourMapEntries {
        first_colour: u16,
        count: u16,
    },
    Bell,
    ServerCutText {
        text: String,
    },
    FileTransferResponse {
        size: u32,
        payload: Bytes,
    },

    /// A run of bytes that did not start a recognised message. `tag` is the
    /// first byte of the run.
    Unknown {
        tag: u8,
        len: usize,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SetPixelFormat => MessageKind::SetPixelFormat,
            Self::SetEncodings { .. } => MessageKind::SetEncodings,
            Self::FramebufferUpdateRequest { .. } => MessageKind::FramebufferUpdateRequest,
            Self::KeyEvent { .. } => MessageKind::KeyEvent,
            Self::PointerEvent { .. } => MessageKind::PointerEvent,
            Self::ClientCutText { .. } => MessageKind::ClientCutText,
            Self::FileTransferRequest { .. } => MessageKind::FileTransferRequest,
            Self::FramebufferUpdate { .. } => MessageKind::FramebufferUpdate,
            Self::SetColourMapEntries { .. } => MessageKind::SetColourMapEntries,
            Self::Bell => MessageKind::Bell,
            Self::ServerCutText { .. } => MessageKind::ServerCutText,
            Self::FileTransferResponse { .. } => MessageKind::FileTransferResponse,
            Self::Unknown { .. } => MessageKind::Unknown,
        }
    }

    /// File name carried by the message, if any.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::FileTransferRequest { file_name, .. } => Some(file_name),
            _ => None,
        }
    }
}

/// Payload-free discriminant of [`Message`], used by gates, policy and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    SetPixelFormat,
    SetEncodings,
    FramebufferUpdateRequest,
    KeyEvent,
    PointerEvent,
    ClientCutText,
    FileTransferRequest,
    FramebufferUpdate,
    SetColourMapEntries,
    Bell,
    ServerCutText,
    FileTransferResponse,
    Unknown,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetPixelFormat => "set_pixel_format",
            Self::SetEncodings => "set_encodings",
            Self::FramebufferUpdateRequest => "framebuffer_update_request",
            Self::KeyEvent => "key_event",
            Self::PointerEvent => "pointer_event",
            Self::ClientCutText => "client_cut_text",
            Self::FileTransferRequest => "file_transfer_request",
            Self::FramebufferUpdate => "framebuffer_update",
            Self::SetColourMapEntries => "set_colour_map_entries",
            Self::Bell => "bell",
            Self::ServerCutText => "server_cut_text",
            Self::FileTransferResponse => "file_transfer_response",
            Self::Unknown => "unknown",
        }
    }

    /// Cut-text in either direction.
    pub fn is_clipboard(self) -> bool {
        matches!(self, Self::ClientCutText | Self::ServerCutText)
    }

    /// File transfer in either direction.
    pub fn is_file_transfer(self) -> bool {
        matches!(self, Self::FileTransferRequest | Self::FileTransferResponse)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message together with where it sits in the decoded window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message: Message,
    /// Byte offset of the first byte of the message in the window.
    pub offset: usize,
    /// Wire length in bytes.
    pub len: usize,
}

impl ParsedMessage {
    /// Range of the message in the decoded window.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}
