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

//! Translation between WebSocket frames and protocol messages.
//!
//! Binary image frames are laid out as:
//!
//! ```text
//! +----------------+----------------------+------------------+
//! | u32 header_len | JSON header (utf-8)  | raw image bytes  |
//! | big endian     | header_len bytes     | header.length    |
//! +----------------+----------------------+------------------+
//! ```
//!
//! All lengths are checked before the payload is touched. The payload is handed out as a slice
//! of the received buffer, never copied.

use crate::error::CodecError;
use crate::protocol::{
    BinaryHeader, ClientMessage, ClipboardContent, ClipboardKind, ClipboardMessage,
    PayloadTransport, ServerMessage,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;
const MAX_HEADER_BYTES: usize = 4096;
const CLIPBOARD_TYPE: &str = "clipboard";

/// A single WebSocket data frame, independent of the transport library carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a client frame means to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Auth { username: String, password: String },
    Clipboard(ClipboardMessage),
    Ping,
}

/// What a relay frame means to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Reply(ServerMessage),
    Clipboard {
        message: ClipboardMessage,
        from: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_bytes: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl MessageCodec {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Reject frames over the size limit before any parsing happens.
    pub fn check_size(&self, frame: &Frame) -> Result<(), CodecError> {
        self.check_len(frame.len())
    }

    fn check_len(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_message_bytes {
            return Err(CodecError::Oversized {
                size,
                limit: self.max_message_bytes,
            });
        }
        Ok(())
    }

    /// Decode a frame received from a client.
    pub fn decode(&self, frame: &Frame) -> Result<Inbound, CodecError> {
        self.check_size(frame)?;
        match frame {
            Frame::Text(text) => self.decode_client_text(text),
            Frame::Binary(bytes) => {
                let (_, message) = self.decode_binary(bytes)?;
                Ok(Inbound::Clipboard(message))
            }
        }
    }

    fn decode_client_text(&self, text: &str) -> Result<Inbound, CodecError> {
        match serde_json::from_str::<ClientMessage>(text)? {
            ClientMessage::Auth { username, password } => Ok(Inbound::Auth {
                username: username.trim().to_string(),
                password: password.trim().to_string(),
            }),
            ClientMessage::Ping => Ok(Inbound::Ping),
            ClientMessage::Clipboard { kind, data, format } => self
                .clipboard_from_json(kind, data, format)
                .map(Inbound::Clipboard),
            ClientMessage::ClipboardUpdate { text, image } => {
                // A data URL image wins over text; anything else in `image` is ignored.
                if is_image_data_url(&image) {
                    self.clipboard_from_json(ClipboardKind::Image, image, None)
                        .map(Inbound::Clipboard)
                } else if !text.trim().is_empty() {
                    Ok(Inbound::Clipboard(ClipboardMessage::text(text)))
                } else {
                    Err(CodecError::EmptyPayload)
                }
            }
        }
    }

    fn clipboard_from_json(
        &self,
        kind: ClipboardKind,
        data: String,
        format: Option<String>,
    ) -> Result<ClipboardMessage, CodecError> {
        match kind {
            ClipboardKind::Text => {
                if data.trim().is_empty() {
                    return Err(CodecError::EmptyPayload);
                }
                Ok(ClipboardMessage::text(data))
            }
            ClipboardKind::Image => {
                let (url_format, encoded) = split_data_url(&data);
                let bytes = STANDARD.decode(encoded.trim())?;
                if bytes.is_empty() {
                    return Err(CodecError::EmptyPayload);
                }
                self.check_len(bytes.len())?;
                Ok(
                    ClipboardMessage::image(format.or(url_format), bytes)
                        .with_transport(PayloadTransport::Json),
                )
            }
        }
    }

    /// Parse and validate a binary image frame, returning its header and message.
    fn decode_binary(&self, frame: &Bytes) -> Result<(BinaryHeader, ClipboardMessage), CodecError> {
        if frame.len() < LENGTH_PREFIX_BYTES {
            return Err(CodecError::Truncated);
        }
        let mut buf = frame.clone();
        let header_len = buf.get_u32() as usize;
        if header_len == 0 || header_len > MAX_HEADER_BYTES {
            return Err(CodecError::BadHeader(format!(
                "header length {header_len} outside 1..={MAX_HEADER_BYTES}"
            )));
        }
        if header_len > buf.remaining() {
            return Err(CodecError::BadHeader(format!(
                "header length {header_len} exceeds the {} bytes that follow",
                buf.remaining()
            )));
        }
        let header: BinaryHeader = serde_json::from_slice(&buf[..header_len])
            .map_err(|e| CodecError::BadHeader(e.to_string()))?;
        buf.advance(header_len);

        if header.message_type != CLIPBOARD_TYPE {
            return Err(CodecError::UnexpectedMessage(
                "binary frames carry only clipboard payloads",
            ));
        }
        if header.kind != ClipboardKind::Image {
            return Err(CodecError::UnexpectedMessage(
                "binary frames carry only image payloads",
            ));
        }
        let declared = usize::try_from(header.length).unwrap_or(usize::MAX);
        self.check_len(declared)?;
        if declared != buf.len() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        if declared == 0 {
            return Err(CodecError::EmptyPayload);
        }

        let message = ClipboardMessage::image(header.format.clone(), buf);
        Ok((header, message))
    }

    /// Encode a clipboard update for delivery, tagged with the sender's username.
    ///
    /// Text and JSON-borne images go out as JSON; binary-borne images go out as binary.
    pub fn encode_clipboard(
        &self,
        message: &ClipboardMessage,
        from: Option<&str>,
    ) -> Result<Frame, CodecError> {
        let from = from.map(str::to_string);
        match (&message.content, message.transport) {
            (ClipboardContent::Text(text), _) => self.encode_server(&ServerMessage::Clipboard {
                kind: ClipboardKind::Text,
                data: text.clone(),
                format: None,
                from,
            }),
            (ClipboardContent::Image { format, bytes }, PayloadTransport::Json) => {
                self.encode_server(&ServerMessage::Clipboard {
                    kind: ClipboardKind::Image,
                    data: STANDARD.encode(bytes),
                    format: format.clone(),
                    from,
                })
            }
            (ClipboardContent::Image { format, bytes }, PayloadTransport::Binary) => {
                let header = BinaryHeader {
                    message_type: CLIPBOARD_TYPE.to_string(),
                    kind: ClipboardKind::Image,
                    format: format.clone(),
                    length: bytes.len() as u64,
                    from,
                };
                encode_binary(&header, bytes)
            }
        }
    }

    pub fn encode_server(&self, message: &ServerMessage) -> Result<Frame, CodecError> {
        Ok(Frame::Text(serde_json::to_string(message)?))
    }

    pub fn encode_client(&self, message: &ClientMessage) -> Result<Frame, CodecError> {
        Ok(Frame::Text(serde_json::to_string(message)?))
    }

    /// Decode a frame received from the relay.
    pub fn decode_server(&self, frame: &Frame) -> Result<ServerEvent, CodecError> {
        match frame {
            Frame::Text(text) => match serde_json::from_str::<ServerMessage>(text)? {
                ServerMessage::Clipboard {
                    kind,
                    data,
                    format,
                    from,
                } => Ok(ServerEvent::Clipboard {
                    message: self.clipboard_from_json(kind, data, format)?,
                    from,
                }),
                other => Ok(ServerEvent::Reply(other)),
            },
            Frame::Binary(bytes) => {
                self.check_size(frame)?;
                let (header, message) = self.decode_binary(bytes)?;
                Ok(ServerEvent::Clipboard {
                    message,
                    from: header.from,
                })
            }
        }
    }
}

fn encode_binary(header: &BinaryHeader, payload: &Bytes) -> Result<Frame, CodecError> {
    let header_json = serde_json::to_vec(header)?;
    let mut buf =
        BytesMut::with_capacity(LENGTH_PREFIX_BYTES + header_json.len() + payload.len());
    buf.put_u32(header_json.len() as u32);
    buf.put_slice(&header_json);
    buf.put_slice(payload);
    Ok(Frame::Binary(buf.freeze()))
}

fn is_image_data_url(data: &str) -> bool {
    data.starts_with("data:image/") && data.contains("base64,")
}

/// Split `data:image/<fmt>;base64,<payload>` into its format and payload. Plain base64 passes
/// through untouched.
fn split_data_url(data: &str) -> (Option<String>, &str) {
    let Some(rest) = data.strip_prefix("data:") else {
        return (None, data);
    };
    let Some((meta, payload)) = rest.split_once(',') else {
        return (None, data);
    };
    let format = meta
        .strip_suffix(";base64")
        .unwrap_or(meta)
        .strip_prefix("image/")
        .filter(|f| !f.is_empty())
        .map(str::to_string);
    (format, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn binary_frame(header: serde_json::Value, payload: &[u8]) -> Frame {
        let header = serde_json::to_vec(&header).unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        buf.put_slice(payload);
        Frame::Binary(buf.freeze())
    }

    #[test]
    fn test_decode_auth_trims_credentials() {
        let codec = MessageCodec::default();
        let frame = Frame::Text(
            json!({"type": "auth", "username": " alice ", "password": "pw\n"}).to_string(),
        );
        assert_eq!(
            codec.decode(&frame).unwrap(),
            Inbound::Auth {
                username: "alice".into(),
                password: "pw".into()
            }
        );
    }

    #[test]
    fn test_decode_text_preserves_content() {
        let codec = MessageCodec::default();
        let frame = Frame::Text(
            json!({"type": "clipboard", "kind": "text", "data": "  hello\n"}).to_string(),
        );
        let Inbound::Clipboard(msg) = codec.decode(&frame).unwrap() else {
            panic!("expected clipboard");
        };
        assert_eq!(msg.content, ClipboardContent::Text("  hello\n".into()));
        assert_eq!(msg.origin, None);
    }

    #[test]
    fn test_decode_rejects_blank_text() {
        let codec = MessageCodec::default();
        let frame =
            Frame::Text(json!({"type": "clipboard", "kind": "text", "data": "  "}).to_string());
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::EmptyPayload)
        ));
    }

    #[test]
    fn test_decode_legacy_update_prefers_image() {
        let codec = MessageCodec::default();
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode([9u8, 8, 7]));
        let frame = Frame::Text(
            json!({"type": "clipboard_update", "text": "ignored", "image": data_url}).to_string(),
        );
        let Inbound::Clipboard(msg) = codec.decode(&frame).unwrap() else {
            panic!("expected clipboard");
        };
        assert_eq!(
            msg.content,
            ClipboardContent::Image {
                format: Some("png".into()),
                bytes: Bytes::from_static(&[9, 8, 7])
            }
        );
        assert_eq!(msg.transport, PayloadTransport::Json);
    }

    #[test]
    fn test_decode_legacy_update_falls_back_to_text() {
        let codec = MessageCodec::default();
        let frame = Frame::Text(
            json!({"type": "clipboard_update", "text": "hello", "image": "not an image"})
                .to_string(),
        );
        let Inbound::Clipboard(msg) = codec.decode(&frame).unwrap() else {
            panic!("expected clipboard");
        };
        assert_eq!(msg.content, ClipboardContent::Text("hello".into()));

        // Bare base64 is not recognised as an image in the legacy shape either.
        let frame = Frame::Text(
            json!({"type": "clipboard_update", "text": "", "image": STANDARD.encode([1u8, 2])})
                .to_string(),
        );
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::EmptyPayload)
        ));
    }

    #[test]
    fn test_decode_legacy_update_empty_is_rejected() {
        let codec = MessageCodec::default();
        let frame = Frame::Text(json!({"type": "clipboard_update"}).to_string());
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::EmptyPayload)
        ));
    }

    #[test]
    fn test_decode_bad_base64() {
        let codec = MessageCodec::default();
        let frame = Frame::Text(
            json!({"type": "clipboard", "kind": "image", "data": "!!not base64!!"}).to_string(),
        );
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_decode_malformed_json() {
        let codec = MessageCodec::default();
        assert!(matches!(
            codec.decode(&Frame::Text("{not json".into())),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_before_parsing() {
        let codec = MessageCodec::new(16);
        // Not valid JSON either, but size is checked first.
        let err = codec.decode(&Frame::Text("x".repeat(17))).unwrap_err();
        assert!(err.is_oversized());
        assert!(codec.decode(&Frame::Text("x".repeat(16))).is_err_and(|e| !e.is_oversized()));
    }

    #[test]
    fn test_binary_image_is_zero_copy_slice() {
        let codec = MessageCodec::default();
        let frame = binary_frame(
            json!({"type": "clipboard", "kind": "image", "format": "png", "length": 4}),
            &[1, 2, 3, 4],
        );
        let Frame::Binary(raw) = &frame else {
            unreachable!()
        };
        let Inbound::Clipboard(msg) = codec.decode(&frame).unwrap() else {
            panic!("expected clipboard");
        };
        let ClipboardContent::Image { format, bytes } = &msg.content else {
            panic!("expected image");
        };
        assert_eq!(format.as_deref(), Some("png"));
        assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]);
        // Payload shares the frame's allocation.
        let offset = bytes.as_ptr() as usize - raw.as_ptr() as usize;
        assert_eq!(offset, raw.len() - 4);
    }

    #[test]
    fn test_binary_declared_length_over_limit() {
        let codec = MessageCodec::default();
        let frame = binary_frame(
            json!({"type": "clipboard", "kind": "image", "length": 11 * 1024 * 1024}),
            &[0; 8],
        );
        assert!(codec.decode(&frame).unwrap_err().is_oversized());
    }

    #[test]
    fn test_binary_length_mismatch() {
        let codec = MessageCodec::default();
        let frame = binary_frame(
            json!({"type": "clipboard", "kind": "image", "length": 10}),
            &[0; 8],
        );
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::LengthMismatch {
                declared: 10,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_binary_header_length_past_end() {
        let codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(500);
        buf.put_slice(b"{}");
        assert!(matches!(
            codec.decode(&Frame::Binary(buf.freeze())),
            Err(CodecError::BadHeader(_))
        ));
        assert!(matches!(
            codec.decode(&Frame::Binary(Bytes::from_static(&[0, 0]))),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_binary_text_kind_rejected() {
        let codec = MessageCodec::default();
        let frame = binary_frame(
            json!({"type": "clipboard", "kind": "text", "length": 2}),
            b"hi",
        );
        assert!(matches!(
            codec.decode(&frame),
            Err(CodecError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_encode_text_carries_sender() {
        let codec = MessageCodec::default();
        let frame = codec
            .encode_clipboard(&ClipboardMessage::text("hello"), Some("alice"))
            .unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected text frame");
        };
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&text).unwrap(),
            json!({"type": "clipboard", "kind": "text", "data": "hello", "from": "alice"})
        );
    }

    #[test]
    fn test_relayed_frames_decode_for_clients_and_relay() {
        let codec = MessageCodec::default();
        let messages = [
            ClipboardMessage::text("über clipboard"),
            ClipboardMessage::image(Some("png".into()), vec![0u8, 255, 17, 42]),
            ClipboardMessage::image(None, vec![5u8; 32]).with_transport(PayloadTransport::Json),
        ];
        for original in messages {
            let frame = codec.encode_clipboard(&original, Some("bob")).unwrap();

            let ServerEvent::Clipboard { message, from } = codec.decode_server(&frame).unwrap()
            else {
                panic!("expected clipboard event");
            };
            assert_eq!(from.as_deref(), Some("bob"));
            assert_eq!(message.content, original.content);

            // The same frame is also a valid upload.
            let Inbound::Clipboard(upload) = codec.decode(&frame).unwrap() else {
                panic!("expected clipboard");
            };
            assert_eq!(upload.content, original.content);
        }
    }

    #[test]
    fn test_decode_server_reply() {
        let codec = MessageCodec::default();
        let frame = codec
            .encode_server(&ServerMessage::auth_accepted("Welcome alice!"))
            .unwrap();
        assert_eq!(
            codec.decode_server(&frame).unwrap(),
            ServerEvent::Reply(ServerMessage::AuthResult {
                success: true,
                reason: None,
                message: Some("Welcome alice!".into())
            })
        );
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(
            split_data_url("data:image/jpeg;base64,AAAA"),
            (Some("jpeg".to_string()), "AAAA")
        );
        assert_eq!(split_data_url("AAAA"), (None, "AAAA"));
        assert_eq!(split_data_url("data:;base64,AAAA"), (None, "AAAA"));
    }
}
