//! Broadcast stream for responses that did not complete a pending call.
//!
//! Every subscriber sees every event published after it subscribed, in
//! publication order. There is no replay buffer. Closing the hub ends all
//! subscriptions cleanly.

use crate::protocol::ParsedResponse;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Classification of a broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// Progress update for a running task.
    Progress,
    /// Terminal event for a running task.
    Completion,
    /// Keyed or keyless response with no matching pending call.
    Unsolicited,
}

impl EventClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Completion => "completion",
            Self::Unsolicited => "unsolicited",
        }
    }
}

/// Out-of-band event published on the broadcast stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "class", content = "response", rename_all = "snake_case")]
pub enum BridgeEvent {
    Progress(ParsedResponse),
    Completion(ParsedResponse),
    Unsolicited(ParsedResponse),
}

impl BridgeEvent {
    pub fn new(class: EventClass, response: ParsedResponse) -> Self {
        match class {
            EventClass::Progress => Self::Progress(response),
            EventClass::Completion => Self::Completion(response),
            EventClass::Unsolicited => Self::Unsolicited(response),
        }
    }

    pub fn class(&self) -> EventClass {
        match self {
            Self::Progress(_) => EventClass::Progress,
            Self::Completion(_) => EventClass::Completion,
            Self::Unsolicited(_) => EventClass::Unsolicited,
        }
    }

    pub fn response(&self) -> &ParsedResponse {
        match self {
            Self::Progress(response) | Self::Completion(response) | Self::Unsolicited(response) => {
                response
            }
        }
    }

    pub fn into_response(self) -> ParsedResponse {
        match self {
            Self::Progress(response) | Self::Completion(response) | Self::Unsolicited(response) => {
                response
            }
        }
    }

    pub fn operation(&self) -> Option<&str> {
        self.response().operation.as_deref()
    }
}

/// Fan-out publish/subscribe point.
#[derive(Debug)]
pub struct BroadcastHub {
    sender: RwLock<Option<broadcast::Sender<BridgeEvent>>>,
    capacity: usize,
}

impl BroadcastHub {
    /// Create an open hub. `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
            capacity,
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            tracing::debug!(class = event.class().as_str(), "hub closed; dropping event");
            return 0;
        };
        // An error only means nobody is listening right now.
        sender.send(event).unwrap_or(0)
    }

    /// Subscribe from this moment on. A closed hub yields an already-ended
    /// subscription.
    pub fn subscribe(&self) -> Subscription {
        let inner = self
            .sender
            .read()
            .as_ref()
            .map(|sender| BroadcastStream::new(sender.subscribe()));
        Subscription { inner }
    }

    /// End every active subscription. Later publishes are dropped.
    pub fn close(&self) {
        self.sender.write().take();
    }

    /// Reopen a closed hub. Subscriptions ended by `close` stay ended.
    pub fn reopen(&self) {
        let mut guard = self.sender.write();
        if guard.is_none() {
            let (sender, _) = broadcast::channel(self.capacity);
            *guard = Some(sender);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// One subscriber's view of the broadcast stream.
///
/// Subscribers that fall more than the hub capacity behind skip the oldest
/// events and keep going.
pub struct Subscription {
    inner: Option<BroadcastStream<BridgeEvent>>,
}

impl Subscription {
    /// Next event, or `None` once the hub has closed.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = BridgeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.get_mut().inner.as_mut() else {
            return Poll::Ready(None);
        };
        loop {
            match Pin::new(&mut *inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!(skipped, "broadcast subscriber lagged; oldest events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Consumer of broadcast events, driven by [`spawn_listener`].
#[async_trait]
pub trait BroadcastListener: Send + Sync {
    /// Human-readable listener name, used in logs.
    fn name(&self) -> &str;

    /// Whether events of `class` should be delivered to this listener.
    fn accepts(&self, _class: EventClass) -> bool {
        true
    }

    /// Handle one event. Runs on the listener's own task, never on the
    /// dispatch path.
    async fn on_event(&self, event: &BridgeEvent);
}

/// Forward every event of `subscription` to `listener` until the hub closes.
pub fn spawn_listener(
    mut subscription: Subscription,
    listener: Arc<dyn BroadcastListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if listener.accepts(event.class()) {
                listener.on_event(&event).await;
            }
        }
        tracing::debug!(listener = listener.name(), "broadcast listener finished");
    })
}
