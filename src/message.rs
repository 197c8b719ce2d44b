//! # Message format and wire codec
//!
//! Every transport carries the same [`Message`] record, framed as a single
//! newline-terminated JSON object. `serde_json`'s compact writer never emits
//! a raw `\n` inside a serialized object (newlines in string fields are
//! escaped), so the trailing `\n` unambiguously marks the frame boundary.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard cap on a single frame's serialized size.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Process id reserved for the broker itself as a message source/target.
pub const BROKER_ID: &str = "broker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

/// The single record that crosses any transport.
///
/// `correlation_id` is required on a `Request` that expects a reply and on
/// the `Response`/`Error` answering it; it is empty for fire-and-forget
/// requests and for events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message {
    pub fn request(id: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageType::Request,
            id: id.into(),
            source: String::new(),
            target: target.into(),
            correlation_id: String::new(),
            payload,
            error: String::new(),
        }
    }

    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageType::Response,
            id: id.into(),
            source: String::new(),
            target: String::new(),
            correlation_id: String::new(),
            payload,
            error: String::new(),
        }
    }

    pub fn event(id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageType::Event,
            id: id.into(),
            source: String::new(),
            target: String::new(),
            correlation_id: String::new(),
            payload,
            error: String::new(),
        }
    }

    pub fn error_reply(id: impl Into<String>, correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            id: id.into(),
            source: BROKER_ID.to_string(),
            target: String::new(),
            correlation_id: correlation_id.into(),
            payload: Value::Null,
            error: error.into(),
        }
    }

    /// Deserialize a payload field into a concrete type, the one spot where
    /// the otherwise-dynamic payload gets a schema imposed on it.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, BrokerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BrokerError::DecodeError(e.to_string()))
    }

    /// Encode as a single newline-terminated JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        let mut bytes = serde_json::to_vec(self).map_err(|e| BrokerError::DecodeError(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(BrokerError::DecodeError(format!(
                "encoded message {} bytes exceeds MAX_MESSAGE_SIZE {}",
                bytes.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode a single frame (without its trailing newline).
    pub fn decode(frame: &[u8]) -> Result<Self, BrokerError> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(BrokerError::DecodeError(format!(
                "frame of {} bytes exceeds MAX_MESSAGE_SIZE {}",
                frame.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        serde_json::from_slice(frame).map_err(|e| BrokerError::DecodeError(e.to_string()))
    }
}

/// Scans `buffer` for complete, brace-balanced JSON objects, respecting
/// string escapes so a `}` inside a quoted string never closes early.
/// Returns the consumed frames in order and truncates `buffer` down to
/// whatever incomplete tail remains (used both for normal shared-memory
/// reads and for recovering a ring's contents on fallback).
pub fn extract_frames(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut start: Option<usize> = None;
    let mut consumed = 0usize;

    for (i, &byte) in buffer.iter().enumerate() {
        if start.is_none() {
            if byte == b'{' {
                start = Some(i);
                depth = 1;
                in_string = false;
                escaped = false;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let begin = start.take().unwrap();
                    frames.push(buffer[begin..=i].to_vec());
                    consumed = i + 1;
                }
            }
            _ => {}
        }
    }

    if consumed > 0 {
        buffer.drain(0..consumed);
    }
    frames
}

/// `"corr-" + unix_nanos + "-" + sequence`, sequence strictly monotonic.
pub fn new_correlation_id(sequence: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("corr-{nanos}-{sequence}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_encode_decode() {
        let msg = Message::request("echo", "svc", json!({"v": 7}));
        let frame = msg.encode().unwrap();
        assert_eq!(*frame.last().unwrap(), b'\n');
        let decoded = Message::decode(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(decoded.id, "echo");
        assert_eq!(decoded.target, "svc");
        assert_eq!(decoded.payload, json!({"v": 7}));
    }

    #[test]
    fn rejects_oversize_frame() {
        let huge = vec![b'a'; MAX_MESSAGE_SIZE + 1];
        assert!(Message::decode(&huge).is_err());
    }

    #[test]
    fn correlation_ids_embed_sequence() {
        let a = new_correlation_id(1);
        let b = new_correlation_id(2);
        assert_ne!(a, b);
        assert!(a.starts_with("corr-"));
    }

    #[test]
    fn extract_frames_splits_concatenated_objects() {
        let mut buf = br#"{"a":1}{"b":"}{}"}"#.to_vec();
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], br#"{"a":1}"#);
        let decoded: Value = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(decoded["b"], "}{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_frames_leaves_incomplete_tail() {
        let mut buf = br#"{"a":1}{"b":2"#.to_vec();
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(buf, br#"{"b":2"#);
    }
}
