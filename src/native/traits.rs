use crate::protocol::{InboundMessage, TaskHandle};
use serde_json::Value;
use tokio::sync::mpsc;

/// Address handed to the native counterpart for all asynchronous replies.
///
/// Delivery is synchronous and non-blocking, so the native event loop may call
/// [`InboundPort::deliver`] from any thread. Messages are dispatched strictly
/// in delivery order.
#[derive(Debug, Clone)]
pub struct InboundPort {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl InboundPort {
    pub(crate) fn new(tx: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self { tx }
    }

    /// Queue one raw message for dispatch.
    pub fn deliver(&self, raw: impl Into<InboundMessage>) -> anyhow::Result<()> {
        self.tx
            .send(raw.into())
            .map_err(|_| anyhow::anyhow!("inbound channel is closed"))
    }

    /// The engine stopped listening (disposed or dropped).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Boundary to the compiled native library.
///
/// All methods are synchronous and may fail. The engine enqueues a pending call
/// before invoking [`NativeBackend::send`], so replies may be delivered on the
/// inbound port before `send` even returns.
pub trait NativeBackend: Send + Sync {
    /// Human-readable backend name, used in logs.
    fn name(&self) -> &str;

    /// One-time handshake giving the native side its reply address.
    fn register_port(&self, port: InboundPort) -> anyhow::Result<()>;

    /// Revoke the reply address registered by [`NativeBackend::register_port`].
    fn unregister_port(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoke `operation` on the native side. The answer arrives later on the
    /// inbound port.
    fn send(&self, operation: &str, args: &Value) -> anyhow::Result<()>;

    /// Start a fire-and-continue operation. Its outcome arrives as broadcast
    /// events tagged with the returned handle.
    fn start_task(&self, operation: &str, _args: &Value) -> anyhow::Result<TaskHandle> {
        anyhow::bail!(
            "backend '{}' does not support fire-and-continue operation '{operation}'",
            self.name()
        )
    }
}
