use super::{InboundMessage, ParsedResponse, PayloadFormat};
use serde_json::{Map, Value};

/// Error text attached to absent or empty inbound messages.
pub const NULL_MESSAGE_ERROR: &str = "null message";

const OPERATION_FIELD: &str = "op";
const SUCCESS_FIELD: &str = "success";
const ERROR_FIELD: &str = "error";
const DATA_FIELD: &str = "data";

/// Decode a raw inbound message. Never fails: undecodable input degrades to a
/// successful, keyless payload holding the raw content.
pub fn parse(raw: impl Into<InboundMessage>) -> ParsedResponse {
    match raw.into() {
        InboundMessage::Empty => null_message(),
        InboundMessage::Text(text) => {
            if text.is_empty() {
                return null_message();
            }
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => from_value(value),
                Err(error) => {
                    tracing::debug!(%error, "inbound message is not JSON; using plain payload");
                    plain(text)
                }
            }
        }
        InboundMessage::Bytes(bytes) => {
            if bytes.is_empty() {
                return null_message();
            }
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => from_value(value),
                Err(error) => {
                    tracing::debug!(%error, "inbound bytes are not JSON; using plain payload");
                    plain(String::from_utf8_lossy(&bytes).into_owned())
                }
            }
        }
        InboundMessage::Value(value) => from_value(value),
    }
}

fn null_message() -> ParsedResponse {
    ParsedResponse {
        operation: None,
        success: false,
        error_message: Some(NULL_MESSAGE_ERROR.to_string()),
        data: None,
        format: PayloadFormat::Empty,
    }
}

fn plain(text: String) -> ParsedResponse {
    ParsedResponse {
        operation: None,
        success: true,
        error_message: None,
        data: Some(Value::String(text)),
        format: PayloadFormat::Plain,
    }
}

fn from_value(value: Value) -> ParsedResponse {
    match value {
        Value::Null => null_message(),
        Value::Object(map) => structured(map),
        scalar => ParsedResponse {
            operation: None,
            success: true,
            error_message: None,
            data: Some(scalar),
            format: PayloadFormat::Scalar,
        },
    }
}

fn structured(mut map: Map<String, Value>) -> ParsedResponse {
    let operation = map
        .get(OPERATION_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .map(str::to_string);
    let success = is_success_marker(map.get(SUCCESS_FIELD));
    let error_message = match map.remove(ERROR_FIELD) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    };
    let data = map.remove(DATA_FIELD).filter(|value| !value.is_null());

    ParsedResponse {
        operation,
        success,
        error_message,
        data,
        format: PayloadFormat::Structured,
    }
}

fn is_success_marker(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text == "true",
        _ => false,
    }
}
