//! Frame Codec
//!
//! Classifies inbound text frames into [`UpstreamFrame`] variants and encodes
//! outbound control frames.
//!
//! Classification order:
//!
//! 1. A JSON array is a batch; each element is decoded on its own so one bad
//!    element does not poison the rest.
//! 2. An object with an `s` field is a data frame.
//! 3. An object with `event == "login"`, or with `status`/`message` and no
//!    `event`, is a login acknowledgement.
//! 4. Any other object with an `event` is a control event.
//! 5. Everything else is unrecognized.

use serde::Serialize;
use serde_json::Value;

use super::messages::{ControlEvent, DataFrame, LoginAck, UpstreamFrame};

/// Codec errors. All of them are protocol errors: the frame is dropped and the
/// receive loop keeps going.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload was not a JSON object or array.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    /// JSON object that matches no known frame shape.
    #[error("unrecognized frame: {0}")]
    UnrecognizedFrame(String),

    /// Data frame with unusable content.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// JSON codec for the upstream feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON or matches no known shape.
    pub fn decode(&self, text: &str) -> Result<UpstreamFrame, CodecError> {
        let trimmed = text.trim();
        if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
            return Err(CodecError::InvalidFormat(preview(trimmed)));
        }

        match serde_json::from_str::<Value>(trimmed)? {
            Value::Array(items) => Ok(UpstreamFrame::Batch(
                items.into_iter().map(Self::decode_data).collect(),
            )),
            Value::Object(map) => {
                let is_data = map.contains_key("s");
                let has_ack_fields = map.contains_key("status") || map.contains_key("message");
                let event = map.get("event").and_then(Value::as_str).map(str::to_owned);
                let value = Value::Object(map);

                if is_data {
                    Ok(UpstreamFrame::Data(serde_json::from_value(value)?))
                } else if event.as_deref() == Some("login") || (event.is_none() && has_ack_fields)
                {
                    Ok(UpstreamFrame::LoginAck(serde_json::from_value::<LoginAck>(value)?))
                } else if event.is_some() {
                    Ok(UpstreamFrame::ControlEvent(serde_json::from_value::<ControlEvent>(
                        value,
                    )?))
                } else {
                    Err(CodecError::UnrecognizedFrame(preview(trimmed)))
                }
            }
            _ => Err(CodecError::InvalidFormat(preview(trimmed))),
        }
    }

    /// Encode an outbound frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode_data(value: Value) -> Result<DataFrame, CodecError> {
        if value.get("s").is_none() {
            return Err(CodecError::UnrecognizedFrame(preview(&value.to_string())));
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn preview(text: &str) -> String {
    text.chars().take(64).collect()
}
