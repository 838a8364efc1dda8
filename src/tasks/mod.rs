//! Per-task view over the broadcast stream.
//!
//! A [`TaskWatcher`] owns its own subscription, so any number of watchers of
//! the same task see every matching event once, in publication order, without
//! interfering with each other.

use crate::error::BridgeError;
use crate::events::{BridgeEvent, Subscription};
use crate::protocol::{ParsedResponse, TaskHandle};
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

/// Progress update for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub task: TaskHandle,
    pub response: ParsedResponse,
}

impl TaskProgress {
    pub fn data(&self) -> Option<&Value> {
        self.response.data.as_ref()
    }
}

/// Event of one task, in publication order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(TaskProgress),
    Completed(ParsedResponse),
}

pub struct TaskWatcher {
    task: TaskHandle,
    task_id_field: String,
    subscription: Subscription,
}

impl TaskWatcher {
    pub fn new(task: TaskHandle, task_id_field: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            task,
            task_id_field: task_id_field.into(),
            subscription,
        }
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }

    /// Next progress or completion event for this task. `None` once the
    /// broadcast stream has closed.
    pub async fn next_event(&mut self) -> Option<TaskEvent> {
        while let Some(event) = self.subscription.next().await {
            if let Some(task_event) = classify(self.task, &self.task_id_field, event) {
                return Some(task_event);
            }
        }
        None
    }

    /// Next progress event for this task, skipping completions.
    pub async fn next_progress(&mut self) -> Option<TaskProgress> {
        loop {
            match self.next_event().await? {
                TaskEvent::Progress(progress) => return Some(progress),
                TaskEvent::Completed(_) => continue,
            }
        }
    }

    /// Continuous progress feed for this task.
    pub fn into_progress_stream(self) -> impl Stream<Item = TaskProgress> + Unpin {
        let task = self.task;
        let field = self.task_id_field;
        self.subscription
            .filter_map(move |event| match classify(task, &field, event) {
                Some(TaskEvent::Progress(progress)) => Some(progress),
                _ => None,
            })
    }

    /// Wait for the first completion event of this task.
    ///
    /// Resolves with the completion payload, or an application error when the
    /// completion reports failure.
    pub async fn completion(mut self) -> Result<Option<Value>, BridgeError> {
        while let Some(event) = self.next_event().await {
            if let TaskEvent::Completed(response) = event {
                tracing::debug!(task = %self.task, success = response.success, "task completed");
                return response.into_result();
            }
        }
        Err(BridgeError::TaskStreamClosed { task: self.task })
    }
}

fn classify(task: TaskHandle, field: &str, event: BridgeEvent) -> Option<TaskEvent> {
    if event.response().task_id(field) != Some(task) {
        return None;
    }
    match event {
        BridgeEvent::Progress(response) => Some(TaskEvent::Progress(TaskProgress { task, response })),
        BridgeEvent::Completion(response) => Some(TaskEvent::Completed(response)),
        BridgeEvent::Unsolicited(_) => None,
    }
}
