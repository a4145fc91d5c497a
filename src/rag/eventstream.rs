//! Decoding of the binary event-stream framing used by streaming model
//! responses.
//!
//! Framing and both CRC checks are handled by the event-stream decoder;
//! this module buffers network chunks and classifies the decoded frames.

use crate::error::{RagError, Result};
use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// String-valued headers only; other header types carry nothing we read.
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A decoded frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// JSON chunk produced by the model.
    Chunk(Value),
    /// Service-side failure reported mid-stream.
    Exception { kind: String, message: String },
    /// Event types that carry nothing for us.
    Other,
}

#[derive(Deserialize)]
struct ChunkEnvelope {
    bytes: String,
}

#[derive(Deserialize)]
struct ExceptionEnvelope {
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// Incremental decoder: push bytes as they arrive, pop whole frames.
pub struct FrameDecoder {
    buffer: BytesMut,
    decoder: MessageFrameDecoder,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            decoder: MessageFrameDecoder::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        !self.buffer.has_remaining()
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    /// A frame whose prelude or message checksum does not match is an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let message = match self.decoder.decode_frame(&mut self.buffer) {
            Ok(DecodedFrame::Complete(message)) => message,
            Ok(DecodedFrame::Incomplete) => return Ok(None),
            Err(e) => {
                return Err(RagError::inference(format!(
                    "corrupt event-stream frame: {}",
                    e
                )));
            }
        };

        let headers = message
            .headers()
            .iter()
            .filter_map(|header| {
                let value = header.value().as_string().ok()?;
                Some((header.name().as_str().to_string(), value.as_str().to_string()))
            })
            .collect();

        Ok(Some(Frame {
            headers,
            payload: message.payload().to_vec(),
        }))
    }
}

pub fn classify(frame: &Frame) -> Result<Message> {
    match frame.header(":message-type") {
        Some("exception") | Some("error") => {
            let kind = frame
                .header(":exception-type")
                .or_else(|| frame.header(":error-code"))
                .unwrap_or("UnknownException")
                .to_string();
            let message = serde_json::from_slice::<ExceptionEnvelope>(&frame.payload)
                .ok()
                .and_then(|e| e.message)
                .or_else(|| frame.header(":error-message").map(str::to_string))
                .unwrap_or_else(|| String::from_utf8_lossy(&frame.payload).to_string());
            Ok(Message::Exception { kind, message })
        }
        _ if frame.header(":event-type") == Some("chunk") => {
            let envelope: ChunkEnvelope = serde_json::from_slice(&frame.payload)?;
            let raw = STANDARD
                .decode(envelope.bytes.as_bytes())
                .map_err(|e| RagError::inference(format!("invalid chunk encoding: {}", e)))?;
            Ok(Message::Chunk(serde_json::from_slice(&raw)?))
        }
        _ => Ok(Message::Other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    const PRELUDE_LEN: usize = 12;
    const CRC_LEN: usize = 4;

    /// Encode one frame with string headers and valid checksums.
    pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }

        let total = PRELUDE_LEN + header_bytes.len() + payload.len() + CRC_LEN;
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        let prelude_crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&prelude_crc.to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(payload);
        let message_crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&message_crc.to_be_bytes());
        frame
    }

    pub(crate) fn chunk_frame(chunk: &Value) -> Vec<u8> {
        let encoded = STANDARD.encode(chunk.to_string());
        let payload = json!({ "bytes": encoded }).to_string();
        encode_frame(
            &[
                (":event-type", "chunk"),
                (":content-type", "application/json"),
                (":message-type", "event"),
            ],
            payload.as_bytes(),
        )
    }

    #[test]
    fn test_decodes_chunk_split_across_pushes() {
        let chunk = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "hi"}});
        let bytes = chunk_frame(&chunk);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..5]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&bytes[5..20]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&bytes[20..]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(classify(&frame).unwrap(), Message::Chunk(chunk));
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decodes_back_to_back_frames() {
        let mut bytes = chunk_frame(&json!({"n": 1}));
        bytes.extend(chunk_frame(&json!({"n": 2})));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        let first = decoder.next_frame().unwrap().unwrap();
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(classify(&first).unwrap(), Message::Chunk(json!({"n": 1})));
        assert_eq!(classify(&second).unwrap(), Message::Chunk(json!({"n": 2})));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_exception_frame() {
        let bytes = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "throttlingException"),
            ],
            br#"{"message":"Too many requests"}"#,
        );

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();

        assert_eq!(
            classify(&frame).unwrap(),
            Message::Exception {
                kind: "throttlingException".to_string(),
                message: "Too many requests".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_payload_checksum_mismatch() {
        let mut bytes = chunk_frame(&json!({"n": 1}));
        let payload_byte = bytes.len() - CRC_LEN - 2;
        bytes[payload_byte] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_rejects_prelude_checksum_mismatch() {
        let mut bytes = chunk_frame(&json!({"n": 1}));
        bytes[PRELUDE_LEN - 1] ^= 0xff;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(decoder.next_frame().is_err());
    }
}
