//! Correlation engine: turns one unordered inbound channel into awaitable
//! call/response pairs plus a broadcast stream of everything else.
//!
//! ```text
//!   caller ── call(key, send) ──▶ registry.enqueue ──▶ send() ──▶ native
//!                                                                  │
//!   native ── InboundPort::deliver ──▶ pump task ──▶ dispatch(raw) ◀┘
//!                                                     │
//!              progress / completion key ─────────────┼──▶ BroadcastHub
//!              key with pending call ─────────────────┼──▶ oldest waiter (FIFO)
//!              keyless string matching a pending key ─┼──▶ oldest waiter
//!              anything else ─────────────────────────┴──▶ BroadcastHub
//! ```
//!
//! Dispatch never blocks: it parses, takes the registry lock once, and either
//! resolves a oneshot slot or publishes to the hub.

pub mod registry;

pub use registry::{CallId, CallResult, CallTicket, Completion, PendingCallRegistry};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::events::{spawn_listener, BridgeEvent, BroadcastHub, BroadcastListener, EventClass, Subscription};
use crate::native::{InboundPort, NativeBackend};
use crate::observability::DispatchTrace;
use crate::protocol::{parse, InboundMessage, ParsedResponse, TaskHandle};
use crate::tasks::TaskWatcher;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Result of dispatching one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Resolved the oldest pending call under its own key.
    Completed { operation: String },
    /// Keyless string payload resolved a call by exact or prefix match.
    HeuristicMatch { operation: String },
    /// Reply owed to a call that already timed out; dropped.
    Discarded { operation: String },
    /// Published to the broadcast stream.
    Broadcast { class: EventClass, delivered: usize },
}

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Calls that were enqueued (initialized engine).
    pub calls_total: u64,
    /// Inbound messages dispatched.
    pub inbound_total: u64,
    /// Calls resolved by a keyed response.
    pub matched_total: u64,
    /// Calls resolved by the keyless exact/prefix fallback.
    pub heuristic_matches_total: u64,
    /// Calls resolved with a timeout (waiter or expiry sweep).
    pub timeouts_total: u64,
    /// Late replies to timed-out calls that were dropped.
    pub late_replies_discarded_total: u64,
    /// Calls whose native send raised.
    pub send_failures_total: u64,
    /// Events published on the broadcast stream.
    pub broadcasts_total: u64,
}

/// A call that was registered and sent, awaiting its reply.
///
/// Dropping it abandons the wait but not the registry slot: the next reply
/// under the key is still consumed by this call, or the expiry sweep removes it.
pub struct PendingReply {
    inner: Arc<EngineInner>,
    id: CallId,
    operation: String,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<CallResult>,
}

impl PendingReply {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Enqueue time plus the call's timeout.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, the deadline, or dispose, whichever comes first.
    /// The deadline counts from when the call was issued, not from this call.
    pub async fn wait(mut self) -> Result<ParsedResponse, BridgeError> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disposed {
                operation: self.operation,
            }),
            Err(_) => {
                if self.inner.registry.time_out(self.id, Instant::now()) {
                    self.inner.stats.lock().timeouts_total += 1;
                    let timeout_ms = millis(self.timeout);
                    tracing::warn!(operation = %self.operation, timeout_ms, "call timed out");
                    self.inner.record_trace(
                        "call_timeout",
                        Some(&self.operation),
                        Some(false),
                        None,
                        json!({ "timeout_ms": timeout_ms }),
                    );
                    return Err(BridgeError::Timeout {
                        operation: self.operation,
                        timeout: self.timeout,
                    });
                }
                // Another terminal transition won the race; its value is in the slot.
                let operation = self.operation;
                self.receiver
                    .await
                    .unwrap_or_else(|_| Err(BridgeError::Disposed { operation }))
            }
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    pump: Option<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    trace_writer: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: BridgeConfig,
    backend: Arc<dyn NativeBackend>,
    registry: PendingCallRegistry,
    hub: BroadcastHub,
    lifecycle: Mutex<Lifecycle>,
    stats: Mutex<EngineStats>,
    trace: RwLock<Option<DispatchTrace>>,
}

/// Explicitly constructed, explicitly passed engine instance. Cloning shares
/// the same engine.
#[derive(Clone)]
pub struct CorrelationEngine {
    inner: Arc<EngineInner>,
}

impl CorrelationEngine {
    pub fn new(config: BridgeConfig, backend: Arc<dyn NativeBackend>) -> Self {
        let hub = BroadcastHub::new(config.broadcast_capacity);
        Self {
            inner: Arc::new(EngineInner {
                config,
                backend,
                registry: PendingCallRegistry::new(),
                hub,
                lifecycle: Mutex::new(Lifecycle::default()),
                stats: Mutex::new(EngineStats::default()),
                trace: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.inner.backend
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Register the inbound channel with the native side and start the
    /// dispatch pump. Idempotent while initialized. Must run within a Tokio
    /// runtime.
    pub fn init(&self) -> Result<(), BridgeError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.initialized {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .backend
            .register_port(InboundPort::new(tx))
            .map_err(BridgeError::Registration)?;
        self.inner.hub.reopen();

        let weak = Arc::downgrade(&self.inner);
        lifecycle.pump = Some(runtime.spawn(pump(weak.clone(), rx)));
        lifecycle.reaper = self
            .inner
            .config
            .reap_interval()
            .map(|period| runtime.spawn(reap(weak, period)));

        if let Some((trace, writer)) =
            DispatchTrace::start(&self.inner.config.trace, &self.inner.config.config_dir)
        {
            tracing::info!(path = %trace.path().display(), "dispatch trace enabled");
            *self.inner.trace.write() = Some(trace);
            lifecycle.trace_writer = Some(writer);
        }

        lifecycle.initialized = true;
        tracing::info!(
            backend = self.inner.backend.name(),
            timeout_ms = self.inner.config.response_timeout_ms,
            "bridge initialized"
        );
        Ok(())
    }

    /// Unregister the inbound channel, fail every pending call with
    /// `Disposed`, close the broadcast stream and mark the engine
    /// uninitialized. Later calls fail fast with `NotInitialized`.
    pub fn dispose(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.initialized {
            return;
        }
        lifecycle.initialized = false;

        if let Err(error) = self.inner.backend.unregister_port() {
            tracing::warn!(backend = self.inner.backend.name(), %error, "failed to unregister inbound channel");
        }
        if let Some(pump) = lifecycle.pump.take() {
            pump.abort();
        }
        if let Some(reaper) = lifecycle.reaper.take() {
            reaper.abort();
        }

        let drained = self.inner.registry.drain();
        self.inner.hub.close();
        // The writer flushes what is queued once its last handle is gone.
        self.inner.trace.write().take();
        lifecycle.trace_writer.take();

        tracing::info!(drained, "bridge disposed");
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lifecycle.lock().initialized
    }

    // ── Calls ─────────────────────────────────────────────────────

    /// Issue a correlated call under `operation` with the default timeout.
    ///
    /// `send` performs the native invocation; it runs after the call is
    /// registered, so a reply delivered before `send` returns still matches.
    /// A response with `success == false` is returned as-is; see
    /// [`CorrelationEngine::request`] for the checked variant.
    pub async fn call<F>(&self, operation: &str, send: F) -> Result<ParsedResponse, BridgeError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        self.call_with_timeout(operation, self.inner.config.response_timeout(), send)
            .await
    }

    /// [`CorrelationEngine::call`] with a per-call timeout.
    pub async fn call_with_timeout<F>(
        &self,
        operation: &str,
        timeout: Duration,
        send: F,
    ) -> Result<ParsedResponse, BridgeError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        self.issue(operation, timeout, send)?.wait().await
    }

    /// Register a call and perform its native send without waiting for the
    /// reply. Calls issued one after another are queued in that order, so
    /// replies under the same key complete them in that order.
    pub fn issue<F>(
        &self,
        operation: &str,
        timeout: Duration,
        send: F,
    ) -> Result<PendingReply, BridgeError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let CallTicket {
            id,
            deadline,
            receiver,
            ..
        } = self.inner.enqueue(operation, timeout)?;

        if let Err(source) = send() {
            self.inner.registry.remove(id);
            self.inner.stats.lock().send_failures_total += 1;
            tracing::warn!(operation, error = %source, "native send failed");
            self.inner.record_trace(
                "call_send_failure",
                Some(operation),
                Some(false),
                Some(&source.to_string()),
                Value::Null,
            );
            return Err(BridgeError::SendFailure {
                operation: operation.to_string(),
                source,
            });
        }

        Ok(PendingReply {
            inner: Arc::clone(&self.inner),
            id,
            operation: operation.to_string(),
            timeout,
            deadline,
            receiver,
        })
    }

    /// Invoke `operation` on the backend and return its payload. A response
    /// with `success == false` becomes `BridgeError::Application`.
    pub async fn request(&self, operation: &str, args: Value) -> Result<Option<Value>, BridgeError> {
        let backend = Arc::clone(&self.inner.backend);
        let response = self
            .call(operation, || backend.send(operation, &args))
            .await?;
        response.into_result()
    }

    // ── Tasks ─────────────────────────────────────────────────────

    /// Start a fire-and-continue operation. The handle comes back
    /// synchronously; progress and completion arrive as broadcast events.
    pub fn start_task(&self, operation: &str, args: Value) -> Result<TaskHandle, BridgeError> {
        if !self.is_initialized() {
            return Err(BridgeError::NotInitialized);
        }
        let handle = self
            .inner
            .backend
            .start_task(operation, &args)
            .map_err(|source| {
                self.inner.stats.lock().send_failures_total += 1;
                BridgeError::SendFailure {
                    operation: operation.to_string(),
                    source,
                }
            })?;
        tracing::debug!(operation, task = %handle, "task started");
        Ok(handle)
    }

    /// Ask the native side to stop a running task. Correlated like any call.
    pub async fn stop_task(&self, task: TaskHandle) -> Result<Option<Value>, BridgeError> {
        let mut args = Map::new();
        args.insert(self.inner.config.task_id_field.clone(), json!(task.id()));
        self.request(&self.inner.config.stop_task_operation, Value::Object(args))
            .await
    }

    /// Watch progress and completion events of `task` from now on.
    pub fn watch_task(&self, task: TaskHandle) -> TaskWatcher {
        TaskWatcher::new(task, self.inner.config.task_id_field.clone(), self.subscribe())
    }

    // ── Broadcast ─────────────────────────────────────────────────

    /// Subscribe to broadcast events from now on.
    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.subscribe()
    }

    /// Forward broadcast events to `listener` on its own task until dispose.
    pub fn add_listener(
        &self,
        listener: Arc<dyn BroadcastListener>,
    ) -> Result<JoinHandle<()>, BridgeError> {
        tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        tracing::debug!(listener = listener.name(), "broadcast listener added");
        Ok(spawn_listener(self.subscribe(), listener))
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// Route one inbound message. Normally driven by the pump task; exposed so
    /// native glue with its own receive loop can call it directly.
    pub fn dispatch(&self, raw: impl Into<InboundMessage>) -> DispatchOutcome {
        self.inner.dispatch(raw.into())
    }

    // ── Introspection ─────────────────────────────────────────────

    pub fn stats(&self) -> EngineStats {
        *self.inner.stats.lock()
    }

    /// Keys with pending calls, in registration order.
    pub fn pending_keys(&self) -> Vec<String> {
        self.inner.registry.pending_keys()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.hub.subscriber_count()
    }
}

impl EngineInner {
    fn enqueue(&self, operation: &str, timeout: Duration) -> Result<CallTicket, BridgeError> {
        // Held across enqueue so dispose cannot drain between the check and the insert.
        let lifecycle = self.lifecycle.lock();
        if !lifecycle.initialized {
            return Err(BridgeError::NotInitialized);
        }
        let ticket = self.registry.enqueue(operation, timeout);
        drop(lifecycle);

        self.stats.lock().calls_total += 1;
        tracing::debug!(operation, call = %ticket.id, "call enqueued");
        Ok(ticket)
    }

    fn dispatch(&self, raw: InboundMessage) -> DispatchOutcome {
        let response = parse(raw);
        self.stats.lock().inbound_total += 1;

        let response = if let Some(operation) = response.operation.clone() {
            if let Some(class) = self.config.classify(&operation) {
                return self.broadcast(class, response);
            }
            match self.registry.try_complete_oldest(&operation, response) {
                Ok(Completion::Resolved) => {
                    self.stats.lock().matched_total += 1;
                    tracing::debug!(operation = %operation, "response matched pending call");
                    self.record_trace("call_matched", Some(&operation), None, None, Value::Null);
                    return DispatchOutcome::Completed { operation };
                }
                Ok(Completion::Discarded) => return self.discarded(operation, None),
                Err(response) => response,
            }
        } else if let Some(payload) = response.data_str().map(str::to_string) {
            match self.registry.try_complete_unkeyed(&payload, response) {
                Ok((operation, Completion::Discarded)) => {
                    return self.discarded(operation, Some(&payload));
                }
                Ok((operation, Completion::Resolved)) => {
                    self.stats.lock().heuristic_matches_total += 1;
                    tracing::debug!(operation = %operation, payload = %payload, "keyless response matched pending call");
                    self.record_trace(
                        "call_heuristic_match",
                        Some(&operation),
                        None,
                        Some(&payload),
                        Value::Null,
                    );
                    return DispatchOutcome::HeuristicMatch { operation };
                }
                Err(response) => response,
            }
        } else {
            response
        };

        self.broadcast(EventClass::Unsolicited, response)
    }

    fn discarded(&self, operation: String, payload: Option<&str>) -> DispatchOutcome {
        self.stats.lock().late_replies_discarded_total += 1;
        tracing::debug!(operation = %operation, "late reply for timed-out call dropped");
        self.record_trace(
            "call_late_reply_discarded",
            Some(&operation),
            None,
            payload,
            Value::Null,
        );
        DispatchOutcome::Discarded { operation }
    }

    fn broadcast(&self, class: EventClass, response: ParsedResponse) -> DispatchOutcome {
        self.stats.lock().broadcasts_total += 1;
        tracing::debug!(
            class = class.as_str(),
            operation = response.operation.as_deref().unwrap_or(""),
            "publishing broadcast event"
        );
        if self.trace.read().is_some() {
            self.record_trace(
                &format!("broadcast_{}", class.as_str()),
                response.operation.as_deref(),
                Some(response.success),
                response.error_message.as_deref(),
                response.data.clone().unwrap_or(Value::Null),
            );
        }
        let delivered = self.hub.publish(BridgeEvent::new(class, response));
        DispatchOutcome::Broadcast { class, delivered }
    }

    fn record_trace(
        &self,
        event_type: &str,
        operation: Option<&str>,
        success: Option<bool>,
        message: Option<&str>,
        payload: Value,
    ) {
        if let Some(trace) = self.trace.read().as_ref() {
            trace.record(event_type, operation, success, message, payload);
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        for handle in [lifecycle.pump.take(), lifecycle.reaper.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn pump(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
    while let Some(raw) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(raw);
    }
    tracing::debug!("inbound pump stopped");
}

async fn reap(inner: Weak<EngineInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let expired = inner.registry.expire(Instant::now());
        if expired.is_empty() {
            continue;
        }
        inner.stats.lock().timeouts_total += expired.len() as u64;
        for operation in &expired {
            tracing::warn!(operation = %operation, "abandoned call expired");
            inner.record_trace("call_timeout", Some(operation), Some(false), Some("expired"), Value::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::LoopbackNative;
    use serde_json::json;

    fn engine_with(config: BridgeConfig) -> (CorrelationEngine, Arc<LoopbackNative>) {
        let backend = Arc::new(LoopbackNative::new());
        let engine = CorrelationEngine::new(config, backend.clone());
        engine.init().unwrap();
        (engine, backend)
    }

    fn engine() -> (CorrelationEngine, Arc<LoopbackNative>) {
        engine_with(BridgeConfig::default())
    }

    #[tokio::test]
    async fn keyed_response_completes_the_call() {
        let (engine, _backend) = engine();
        let caller = engine.clone();
        let call = tokio::spawn(async move { caller.call("op1", || Ok(())).await });
        tokio::task::yield_now().await;
        while engine.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let outcome = engine.dispatch(r#"{"op":"op1","success":true,"data":"x"}"#);
        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                operation: "op1".into()
            }
        );

        let response = call.await.unwrap().unwrap();
        assert!(response.success);
        assert_eq!(response.data, Some(json!("x")));
        assert_eq!(engine.stats().matched_total, 1);
    }

    #[tokio::test]
    async fn reply_delivered_during_send_still_matches() {
        let (engine, backend) = engine();
        let emitter = backend.clone();
        let response = engine
            .call("login", move || {
                emitter.emit(r#"{"op":"login","success":true,"data":"token"}"#)
            })
            .await
            .unwrap();
        assert_eq!(response.data_str(), Some("token"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn issued_calls_complete_in_issue_order() {
        let (engine, backend) = engine();
        let timeout = Duration::from_secs(5);
        let first = engine.issue("op2", timeout, || Ok(())).unwrap();
        let second = engine.issue("op2", timeout, || Ok(())).unwrap();
        assert_eq!(second.operation(), "op2");

        backend.emit(r#"{"op":"op2","success":true,"data":"first"}"#).unwrap();
        backend.emit(r#"{"op":"op2","success":true,"data":"second"}"#).unwrap();

        let second = second.wait().await.unwrap();
        let first = first.wait().await.unwrap();
        assert_eq!(first.data_str(), Some("first"));
        assert_eq!(second.data_str(), Some("second"));
    }

    #[tokio::test]
    async fn send_failure_leaves_no_registry_entry() {
        let (engine, _backend) = engine();
        let error = engine
            .call("upload", || Err(anyhow::anyhow!("library not loaded")))
            .await
            .unwrap_err();

        assert!(matches!(error, BridgeError::SendFailure { .. }));
        assert!(error.is_transport());
        assert_eq!(engine.pending_count(), 0);
        assert!(engine.pending_keys().is_empty());
        assert_eq!(engine.stats().send_failures_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_dropped_without_shifting_fifo() {
        let (engine, backend) = engine_with(BridgeConfig {
            reap_interval_ms: 0,
            ..BridgeConfig::default()
        });
        let mut events = engine.subscribe();

        let error = engine
            .call_with_timeout("op", Duration::from_millis(50), || Ok(()))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().timeouts_total, 1);

        let next = engine.issue("op", Duration::from_secs(5), || Ok(())).unwrap();
        backend.emit(r#"{"op":"op","success":true,"data":"reply-for-first"}"#).unwrap();
        backend.emit(r#"{"op":"op","success":true,"data":"reply-for-next"}"#).unwrap();

        let response = next.wait().await.unwrap();
        assert_eq!(response.data_str(), Some("reply-for-next"));
        assert_eq!(engine.stats().late_replies_discarded_total, 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), events.recv())
                .await
                .is_err(),
            "a dropped late reply must not reach the broadcast stream"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_reports_discarded_late_reply() {
        let (engine, _backend) = engine_with(BridgeConfig {
            reap_interval_ms: 0,
            ..BridgeConfig::default()
        });
        let _ = engine
            .call_with_timeout("slow", Duration::from_millis(50), || Ok(()))
            .await;

        assert_eq!(
            engine.dispatch(r#"{"op":"slow","success":true}"#),
            DispatchOutcome::Discarded {
                operation: "slow".into()
            }
        );
        assert!(matches!(
            engine.dispatch(r#"{"op":"slow","success":true}"#),
            DispatchOutcome::Broadcast {
                class: EventClass::Unsolicited,
                ..
            }
        ));
    }

    #[test]
    fn timeout_millis_saturate_instead_of_truncating() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_deadline_counts_from_issue() {
        let (engine, _backend) = engine_with(BridgeConfig {
            reap_interval_ms: 0,
            ..BridgeConfig::default()
        });
        let issued_at = Instant::now();
        let pending = engine
            .issue("op", Duration::from_millis(100), || Ok(()))
            .unwrap();
        assert_eq!(pending.deadline(), issued_at + Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(90)).await;
        let error = pending.wait().await.unwrap_err();

        assert!(error.is_timeout());
        let elapsed = issued_at.elapsed();
        assert!(
            elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(150),
            "timed out {elapsed:?} after issue"
        );
    }

    #[tokio::test]
    async fn dispatch_trace_records_engine_outcomes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            config_dir: tmp.path().to_path_buf(),
            trace: crate::config::TraceConfig {
                mode: "full".into(),
                ..crate::config::TraceConfig::default()
            },
            ..BridgeConfig::default()
        };
        let path = crate::observability::resolve_trace_path(&config.trace, tmp.path());
        let (engine, backend) = engine_with(config);

        let emitter = backend.clone();
        engine
            .call("login", move || {
                emitter.emit(r#"{"op":"login","success":true}"#)
            })
            .await
            .unwrap();
        let _ = engine
            .call_with_timeout("slow", Duration::from_millis(20), || Ok(()))
            .await;
        let _ = engine.call("upload", || Err(anyhow::anyhow!("library not loaded"))).await;
        engine.dispatch(r#"{"op":"slow","success":true}"#);
        engine.dispatch(r#"{"op":"auth_callback","success":true}"#);
        engine.dispose();

        let expected = [
            "call_matched",
            "call_timeout",
            "call_send_failure",
            "call_late_reply_discarded",
            "broadcast_unsolicited",
        ];
        let mut recorded = Vec::new();
        for _ in 0..200 {
            recorded = crate::observability::load_events(&path, 50, None)
                .unwrap()
                .into_iter()
                .rev()
                .map(|event| event.event_type)
                .collect::<Vec<_>>();
            if recorded.len() >= expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorded, expected);
    }

    #[tokio::test]
    async fn progress_keys_never_consume_pending_calls() {
        let (engine, _backend) = engine();
        let _pending = engine.inner.enqueue("upload_progress", Duration::from_secs(5)).unwrap();
        let mut events = engine.subscribe();

        let outcome = engine.dispatch(r#"{"op":"upload_progress","success":true,"data":{"task_id":1}}"#);
        assert!(matches!(
            outcome,
            DispatchOutcome::Broadcast {
                class: EventClass::Progress,
                delivered: 1
            }
        ));
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(events.recv().await.unwrap().class(), EventClass::Progress);
    }

    #[tokio::test]
    async fn keyless_string_prefix_matches_pending_key() {
        let (engine, _backend) = engine();
        let ticket = engine.inner.enqueue("ack", Duration::from_secs(5)).unwrap();

        let outcome = engine.dispatch("ack-123");
        assert_eq!(
            outcome,
            DispatchOutcome::HeuristicMatch {
                operation: "ack".into()
            }
        );
        let response = ticket.receiver.await.unwrap().unwrap();
        assert_eq!(response.data_str(), Some("ack-123"));
        assert_eq!(engine.stats().heuristic_matches_total, 1);
    }

    #[tokio::test]
    async fn unmatched_keyless_payload_is_unsolicited() {
        let (engine, _backend) = engine();
        let outcome = engine.dispatch(json!({"token": "abc"}));
        assert_eq!(
            outcome,
            DispatchOutcome::Broadcast {
                class: EventClass::Unsolicited,
                delivered: 0
            }
        );
    }

    #[tokio::test]
    async fn calls_before_init_and_after_dispose_fail_fast() {
        let backend = Arc::new(LoopbackNative::new());
        let engine = CorrelationEngine::new(BridgeConfig::default(), backend.clone());
        assert!(matches!(
            engine.call("op", || Ok(())).await,
            Err(BridgeError::NotInitialized)
        ));

        engine.init().unwrap();
        engine.init().unwrap();
        assert_eq!(backend.registrations(), 1);

        engine.dispose();
        assert!(!engine.is_initialized());
        assert!(!backend.is_registered());
        assert!(matches!(
            engine.call("op", || Ok(())).await,
            Err(BridgeError::NotInitialized)
        ));
        assert!(matches!(
            engine.start_task("upload", Value::Null),
            Err(BridgeError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn dispose_fails_pending_calls_and_closes_stream() {
        let (engine, _backend) = engine();
        let ticket = engine.inner.enqueue("list", Duration::from_secs(5)).unwrap();
        let mut events = engine.subscribe();

        engine.dispose();
        assert!(matches!(
            ticket.receiver.await.unwrap(),
            Err(BridgeError::Disposed { .. })
        ));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn reinit_after_dispose_registers_again() {
        let (engine, backend) = engine();
        engine.dispose();
        engine.init().unwrap();
        assert_eq!(backend.registrations(), 2);

        let emitter = backend.clone();
        let response = engine
            .call("ping", move || emitter.emit(r#"{"op":"ping","success":true}"#))
            .await
            .unwrap();
        assert!(response.success);
    }

    #[test]
    fn init_without_runtime_is_an_error() {
        let engine = CorrelationEngine::new(BridgeConfig::default(), Arc::new(LoopbackNative::new()));
        assert!(matches!(engine.init(), Err(BridgeError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_abandoned_calls() {
        let (engine, _backend) = engine_with(BridgeConfig {
            reap_interval_ms: 10,
            ..BridgeConfig::default()
        });
        let caller = engine.clone();
        let abandoned = tokio::spawn(async move {
            caller
                .call_with_timeout("orphan", Duration::from_millis(30), || Ok(()))
                .await
        });
        while engine.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        abandoned.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().timeouts_total, 1);
    }

    #[tokio::test]
    async fn request_maps_failure_to_application_error() {
        let backend = Arc::new(LoopbackNative::with_responder(|operation, _args| {
            vec![InboundMessage::Value(json!({
                "op": operation,
                "success": false,
                "error": "permission denied",
                "data": {"path": "/secret"},
            }))]
        }));
        let engine = CorrelationEngine::new(BridgeConfig::default(), backend);
        engine.init().unwrap();

        let error = engine.request("read", json!({"path": "/secret"})).await.unwrap_err();
        match error {
            BridgeError::Application { message, detail, .. } => {
                assert_eq!(message, "permission denied");
                assert_eq!(detail, Some(json!({"path": "/secret"})));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_task_sends_task_id_under_configured_key() {
        let backend = Arc::new(LoopbackNative::echo());
        let engine = CorrelationEngine::new(BridgeConfig::default(), backend.clone());
        engine.init().unwrap();

        let task = engine.start_task("upload", json!({"file": "a.txt"})).unwrap();
        let echoed = engine.stop_task(task).await.unwrap();

        assert_eq!(echoed, Some(json!({"task_id": task.id()})));
        let sent = backend.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].operation, "stop_task");
    }
}
