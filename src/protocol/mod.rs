//! Wire-level types exchanged with the native counterpart.
//!
//! Inbound traffic arrives as an [`InboundMessage`] and is decoded exactly once
//! into a [`ParsedResponse`] by [`parse`]. Nothing here retains a message past a
//! single dispatch cycle.

pub mod parser;

pub use parser::{parse, NULL_MESSAGE_ERROR};

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Raw value delivered by the native side on the inbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Nothing was delivered (a null pointer or an absent payload).
    Empty,
    /// UTF-8 text, usually a serialized JSON object.
    Text(String),
    /// Raw bytes; decoded as JSON when possible, otherwise as lossy UTF-8.
    Bytes(Vec<u8>),
    /// A value the native glue already decoded.
    Value(Value),
}

impl From<String> for InboundMessage {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for InboundMessage {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for InboundMessage {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Value> for InboundMessage {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl<T> From<Option<T>> for InboundMessage
where
    T: Into<InboundMessage>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Into::into)
    }
}

/// How the parser arrived at a [`ParsedResponse`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Absent or empty input.
    Empty,
    /// A structured object with `op` / `success` / `error` / `data` fields.
    #[default]
    Structured,
    /// Valid JSON that was not an object (a bare string, number, array...).
    Scalar,
    /// Not decodable at all; the raw content became the payload.
    Plain,
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Operation key used for correlation, when the message carried one.
    #[serde(rename = "op", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub success: bool,
    #[serde(rename = "error", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip)]
    pub format: PayloadFormat,
}

impl ParsedResponse {
    /// Successful response for `operation` carrying `data`.
    pub fn ok(operation: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            operation: Some(operation.into()),
            success: true,
            error_message: None,
            data,
            format: PayloadFormat::Structured,
        }
    }

    /// Failed response for `operation` with an error message.
    pub fn failed(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            success: false,
            error_message: Some(error.into()),
            data: None,
            format: PayloadFormat::Structured,
        }
    }

    /// Payload as a string slice, when the payload is a JSON string.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }

    /// Task identifier embedded in the payload object under `field`.
    ///
    /// Accepts integers and numeric strings.
    pub fn task_id(&self, field: &str) -> Option<TaskHandle> {
        let raw = self.data.as_ref()?.as_object()?.get(field)?;
        match raw {
            Value::Number(number) => number.as_i64().map(TaskHandle),
            Value::String(text) => text.trim().parse().ok().map(TaskHandle),
            _ => None,
        }
    }

    /// Convert into the payload on success, or an application failure.
    pub fn into_result(self) -> Result<Option<Value>, BridgeError> {
        if self.success {
            return Ok(self.data);
        }
        Err(BridgeError::Application {
            operation: self.operation,
            message: self
                .error_message
                .unwrap_or_else(|| "native call reported failure".to_string()),
            detail: self.data,
        })
    }
}

/// Identifier returned synchronously by fire-and-continue native calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub i64);

impl TaskHandle {
    pub fn id(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}
