//! In-process native counterpart.
//!
//! Records every outbound call and answers through the registered inbound port,
//! either from a scripted responder or by explicit [`LoopbackNative::emit`].

use super::traits::{InboundPort, NativeBackend};
use crate::protocol::{InboundMessage, TaskHandle};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Produces the replies for one outbound call.
pub type Responder = dyn Fn(&str, &Value) -> Vec<InboundMessage> + Send + Sync;

/// One recorded outbound invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCall {
    pub operation: String,
    pub args: Value,
}

pub struct LoopbackNative {
    port: Mutex<Option<InboundPort>>,
    sent: Mutex<Vec<SentCall>>,
    failing: Mutex<HashMap<String, String>>,
    responder: Option<Box<Responder>>,
    next_task: AtomicI64,
    registrations: AtomicUsize,
}

impl Default for LoopbackNative {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNative {
    /// Silent counterpart: records calls, never answers on its own.
    pub fn new() -> Self {
        Self {
            port: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashMap::new()),
            responder: None,
            next_task: AtomicI64::new(1),
            registrations: AtomicUsize::new(0),
        }
    }

    /// Counterpart that answers each call with the replies `responder` returns.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    /// Counterpart that answers every call with `{op, success: true, data: args}`.
    pub fn echo() -> Self {
        Self::with_responder(|operation, args| {
            vec![InboundMessage::Value(json!({
                "op": operation,
                "success": true,
                "data": args,
            }))]
        })
    }

    /// Make every later `send` of `operation` fail with `message`.
    pub fn fail_operation(&self, operation: impl Into<String>, message: impl Into<String>) {
        self.failing.lock().insert(operation.into(), message.into());
    }

    /// Push a raw message through the registered port.
    pub fn emit(&self, raw: impl Into<InboundMessage>) -> anyhow::Result<()> {
        let port = self
            .port
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no inbound port registered"))?;
        port.deliver(raw)
    }

    /// Snapshot of every call sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentCall> {
        self.sent.lock().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.port.lock().is_some()
    }

    /// How many times a port was registered over the backend's lifetime.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &str, args: &Value) {
        self.sent.lock().push(SentCall {
            operation: operation.to_string(),
            args: args.clone(),
        });
    }
}

impl NativeBackend for LoopbackNative {
    fn name(&self) -> &str {
        "loopback"
    }

    fn register_port(&self, port: InboundPort) -> anyhow::Result<()> {
        let mut slot = self.port.lock();
        if slot.is_some() {
            anyhow::bail!("inbound port already registered");
        }
        *slot = Some(port);
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_port(&self) -> anyhow::Result<()> {
        self.port.lock().take();
        Ok(())
    }

    fn send(&self, operation: &str, args: &Value) -> anyhow::Result<()> {
        if let Some(message) = self.failing.lock().get(operation) {
            anyhow::bail!("{message}");
        }
        self.record(operation, args);

        if let Some(responder) = &self.responder {
            for reply in responder(operation, args) {
                self.emit(reply)?;
            }
        }
        Ok(())
    }

    fn start_task(&self, operation: &str, args: &Value) -> anyhow::Result<TaskHandle> {
        if let Some(message) = self.failing.lock().get(operation) {
            anyhow::bail!("{message}");
        }
        self.record(operation, args);
        Ok(TaskHandle(self.next_task.fetch_add(1, Ordering::SeqCst)))
    }
}
