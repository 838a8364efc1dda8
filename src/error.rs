use crate::protocol::TaskHandle;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the correlation engine.
///
/// Transport failures (the native layer never produced an answer) and
/// application failures (the native layer answered and rejected the call) are
/// kept apart so callers can tell them apart.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("native send for `{operation}` failed: {source}")]
    SendFailure {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no response for `{operation}` within {}ms", .timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("native call {} failed: {message}", .operation.as_deref().unwrap_or("<unkeyed>"))]
    Application {
        operation: Option<String>,
        message: String,
        detail: Option<Value>,
    },
    #[error("bridge is not initialized")]
    NotInitialized,
    #[error("bridge was disposed while `{operation}` was pending")]
    Disposed { operation: String },
    #[error("bridge init requires a running Tokio runtime")]
    NoRuntime,
    #[error("failed to register inbound channel with native counterpart: {0}")]
    Registration(#[source] anyhow::Error),
    #[error("event stream closed before {task} completed")]
    TaskStreamClosed { task: TaskHandle },
}

impl BridgeError {
    /// The native layer never produced an answer for the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::SendFailure { .. } | Self::Timeout { .. } | Self::Disposed { .. } | Self::NotInitialized
        )
    }

    /// The native layer answered and reported failure.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
