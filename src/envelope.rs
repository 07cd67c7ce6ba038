//! Wire envelope codec.
//!
//! Every message on the feeder protocol is a JSON object. Command-style
//! traffic carries a full header (`cmd`, `msgId`, `ts`) plus command-specific
//! fields at the top level. The heart and ntp channels are a firmware
//! irregularity: their frames may omit `cmd` and `msgId` entirely, so they
//! get their own lightweight [`SystemFrame`] shape instead of being forced
//! through [`Envelope`] with optional fields.
//!
//! The codec decodes headers only. Unknown command ids are not an error
//! here - classifying them is the dispatcher's job.

use rand::RngCore;
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire field names, shared by encode and decode.
const FIELD_CMD: &str = "cmd";
const FIELD_MSG_ID: &str = "msgId";
const FIELD_TS: &str = "ts";

/// Number of random bytes behind a message id (32 hex chars on the wire).
const MESSAGE_ID_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Unique id correlating a request with its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; MESSAGE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        MessageId(hex::encode(bytes))
    }

    pub fn from_wire(value: &str) -> Self {
        MessageId(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully-headed protocol message.
///
/// `command` stays a raw integer here; the dispatcher maps it onto the
/// command registry. `fields` holds everything except the three header keys.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub command: u32,
    pub message_id: MessageId,
    pub timestamp_ms: i64,
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Serialize an envelope. Deterministic for identical inputs: the
    /// underlying map keeps keys sorted, so equal inputs give equal bytes.
    pub fn encode(
        command: u32,
        message_id: &MessageId,
        timestamp_ms: i64,
        fields: &Map<String, Value>,
    ) -> Vec<u8> {
        let mut object = fields.clone();
        object.insert(FIELD_CMD.into(), Value::from(command));
        object.insert(FIELD_MSG_ID.into(), Value::from(message_id.as_str()));
        object.insert(FIELD_TS.into(), Value::from(timestamp_ms));
        // Serializing a Map<String, Value> cannot fail.
        serde_json::to_vec(&Value::Object(object)).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "expected object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let command = take_u32(&mut object, FIELD_CMD)?;
        let message_id = match object.remove(FIELD_MSG_ID) {
            Some(Value::String(s)) => MessageId(s),
            Some(_) => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "{} is not a string",
                    FIELD_MSG_ID
                )))
            }
            None => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "missing {}",
                    FIELD_MSG_ID
                )))
            }
        };
        let timestamp_ms = take_i64(&mut object, FIELD_TS)?;

        Ok(Envelope {
            command,
            message_id,
            timestamp_ms,
            fields: object,
        })
    }
}

/// Headerless frame used on the heart and ntp channels.
///
/// Only `ts` is required; `cmd` and `msgId` are carried when present so the
/// ntp path can still correlate sync responses.
#[derive(Clone, Debug, PartialEq)]
pub struct SystemFrame {
    pub command: Option<u32>,
    pub message_id: Option<MessageId>,
    pub timestamp_ms: i64,
    pub fields: Map<String, Value>,
}

impl SystemFrame {
    pub fn decode(payload: &[u8]) -> Result<SystemFrame, DecodeError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::MalformedEnvelope(format!("invalid JSON: {}", e)))?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "expected object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let command = match object.remove(FIELD_CMD) {
            Some(value) => Some(as_u32(&value, FIELD_CMD)?),
            None => None,
        };
        let message_id = match object.remove(FIELD_MSG_ID) {
            Some(Value::String(s)) => Some(MessageId(s)),
            Some(_) => {
                return Err(DecodeError::MalformedEnvelope(format!(
                    "{} is not a string",
                    FIELD_MSG_ID
                )))
            }
            None => None,
        };
        let timestamp_ms = take_i64(&mut object, FIELD_TS)?;

        Ok(SystemFrame {
            command,
            message_id,
            timestamp_ms,
            fields: object,
        })
    }

    /// Serialize a frame for the heart/ntp channels. Header fields are
    /// emitted only when present.
    pub fn encode(
        command: Option<u32>,
        message_id: Option<&MessageId>,
        timestamp_ms: i64,
        fields: &Map<String, Value>,
    ) -> Vec<u8> {
        let mut object = fields.clone();
        if let Some(command) = command {
            object.insert(FIELD_CMD.into(), Value::from(command));
        }
        if let Some(message_id) = message_id {
            object.insert(FIELD_MSG_ID.into(), Value::from(message_id.as_str()));
        }
        object.insert(FIELD_TS.into(), Value::from(timestamp_ms));
        serde_json::to_vec(&Value::Object(object)).unwrap_or_default()
    }
}

fn take_u32(object: &mut Map<String, Value>, key: &str) -> Result<u32, DecodeError> {
    match object.remove(key) {
        Some(value) => as_u32(&value, key),
        None => Err(DecodeError::MalformedEnvelope(format!("missing {}", key))),
    }
}

fn as_u32(value: &Value, key: &str) -> Result<u32, DecodeError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DecodeError::MalformedEnvelope(format!("{} is not a u32", key)))
}

fn take_i64(object: &mut Map<String, Value>, key: &str) -> Result<i64, DecodeError> {
    match object.remove(key) {
        Some(value) => value
            .as_i64()
            .ok_or_else(|| DecodeError::MalformedEnvelope(format!("{} is not an integer", key))),
        None => Err(DecodeError::MalformedEnvelope(format!("missing {}", key))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
