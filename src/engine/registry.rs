//! Pending call registry: operation key → FIFO queue of outstanding calls.
//!
//! Every terminal transition (match, removal, timeout, expiry, drain) takes the
//! call out of its slot under the registry lock before resolving it, so each
//! call is resolved at most once.
//!
//! A call that times out leaves a tombstone in its queue position. The native
//! side still owes it a reply; when that reply arrives it is dropped instead of
//! completing the next call under the key. The expiry sweep forgets tombstones
//! once their grace period (one more timeout) has passed.

use crate::error::BridgeError;
use crate::protocol::ParsedResponse;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Terminal value delivered to a call's waiter.
pub type CallResult = Result<ParsedResponse, BridgeError>;

/// Identity of one pending call, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Registry-owned record of an outstanding call.
#[derive(Debug)]
struct PendingCall {
    id: CallId,
    deadline: Instant,
    timeout: Duration,
    slot: oneshot::Sender<CallResult>,
}

#[derive(Debug)]
enum Entry {
    Waiting(PendingCall),
    /// Timed out; the reply it is still owed gets discarded.
    TimedOut { id: CallId, forget_at: Instant },
}

impl Entry {
    fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting(_))
    }
}

/// Waiter side of an enqueued call.
#[derive(Debug)]
pub struct CallTicket {
    pub id: CallId,
    pub operation: String,
    /// Enqueue time plus the call's timeout.
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<CallResult>,
}

/// What a reply routed to a key's queue did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The oldest waiting call received it.
    Resolved,
    /// It was owed to a call that had already timed out, and was dropped.
    Discarded,
}

#[derive(Debug)]
struct KeyQueue {
    registered: u64,
    entries: VecDeque<Entry>,
}

impl KeyQueue {
    fn waiting(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_waiting()).count()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    next_call_id: u64,
    next_key_sequence: u64,
    queues: HashMap<String, KeyQueue>,
}

impl RegistryState {
    /// Keys in the order their current queue was created. With
    /// `waiting_only`, keys holding nothing but tombstones are left out.
    fn keys_in_registration_order(&self, waiting_only: bool) -> Vec<String> {
        let mut keys: Vec<(&String, u64)> = self
            .queues
            .iter()
            .filter(|(_, queue)| !waiting_only || queue.waiting() > 0)
            .map(|(key, queue)| (key, queue.registered))
            .collect();
        keys.sort_by_key(|(_, registered)| *registered);
        keys.into_iter().map(|(key, _)| key.clone()).collect()
    }

    fn pop_oldest(&mut self, key: &str) -> Option<Entry> {
        let queue = self.queues.get_mut(key)?;
        let entry = queue.entries.pop_front();
        if queue.entries.is_empty() {
            self.queues.remove(key);
        }
        entry
    }

    fn key_of(&self, id: CallId) -> Option<String> {
        self.queues
            .iter()
            .find(|(_, queue)| {
                queue
                    .entries
                    .iter()
                    .any(|entry| matches!(entry, Entry::Waiting(call) if call.id == id))
            })
            .map(|(key, _)| key.clone())
    }
}

#[derive(Debug, Default)]
pub struct PendingCallRegistry {
    state: Mutex<RegistryState>,
}

impl PendingCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call to `key`'s queue, creating the queue if needed.
    pub fn enqueue(&self, key: &str, timeout: Duration) -> CallTicket {
        let (slot, receiver) = oneshot::channel();
        let deadline = deadline_after(Instant::now(), timeout);
        let mut state = self.state.lock();
        state.next_call_id += 1;
        let id = CallId(state.next_call_id);

        if !state.queues.contains_key(key) {
            state.next_key_sequence += 1;
            let registered = state.next_key_sequence;
            state.queues.insert(
                key.to_string(),
                KeyQueue {
                    registered,
                    entries: VecDeque::new(),
                },
            );
        }
        if let Some(queue) = state.queues.get_mut(key) {
            queue.entries.push_back(Entry::Waiting(PendingCall {
                id,
                deadline,
                timeout,
                slot,
            }));
        }

        CallTicket {
            id,
            operation: key.to_string(),
            deadline,
            receiver,
        }
    }

    /// Route `response` to the oldest entry under `key`: resolve the oldest
    /// call, or drop the reply owed to a timed-out one.
    ///
    /// Returns the response back when `key` has no queue.
    pub fn try_complete_oldest(
        &self,
        key: &str,
        response: ParsedResponse,
    ) -> Result<Completion, ParsedResponse> {
        let entry = self.state.lock().pop_oldest(key);
        match entry {
            Some(entry) => Ok(deliver(entry, response)),
            None => Err(response),
        }
    }

    /// Route a reply to the oldest entry under `key`. `false` when nothing
    /// was queued.
    pub fn complete_oldest(&self, key: &str, response: ParsedResponse) -> bool {
        self.try_complete_oldest(key, response).is_ok()
    }

    /// Match a keyless string payload against queued keys: first an exact
    /// match, then the first key the payload starts with. Keys are tried in
    /// registration order. Returns the matched key, or the response back.
    pub fn try_complete_unkeyed(
        &self,
        payload: &str,
        response: ParsedResponse,
    ) -> Result<(String, Completion), ParsedResponse> {
        let matched = {
            let mut state = self.state.lock();
            let keys = state.keys_in_registration_order(false);
            let key = keys
                .iter()
                .find(|key| key.as_str() == payload)
                .or_else(|| keys.iter().find(|key| payload.starts_with(key.as_str())))
                .cloned();
            key.and_then(|key| state.pop_oldest(&key).map(|entry| (key, entry)))
        };

        match matched {
            Some((key, entry)) => Ok((key, deliver(entry, response))),
            None => Err(response),
        }
    }

    /// Drop a waiting call whose send never happened. No reply is owed, so no
    /// tombstone is left. `false` when it already reached a terminal transition.
    pub fn remove(&self, id: CallId) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.key_of(id) else {
            return false;
        };

        let mut emptied = false;
        if let Some(queue) = state.queues.get_mut(&key) {
            queue
                .entries
                .retain(|entry| !matches!(entry, Entry::Waiting(call) if call.id == id));
            emptied = queue.entries.is_empty();
        }
        if emptied {
            state.queues.remove(&key);
        }
        true
    }

    /// Time out a waiting call at `now`, leaving a tombstone in its queue
    /// position. `false` when it already reached a terminal transition.
    pub fn time_out(&self, id: CallId, now: Instant) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.key_of(id) else {
            return false;
        };
        let Some(queue) = state.queues.get_mut(&key) else {
            return false;
        };
        for entry in &mut queue.entries {
            if let Entry::Waiting(call) = entry {
                if call.id == id {
                    let forget_at = deadline_after(now, call.timeout);
                    *entry = Entry::TimedOut { id, forget_at };
                    return true;
                }
            }
        }
        false
    }

    /// Resolve every call whose deadline is at or before `now` with a timeout
    /// and forget tombstones whose grace has passed. Returns the operations
    /// that timed out.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let mut forgotten = 0usize;
        let expired: Vec<(String, PendingCall)> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            state.queues.retain(|key, queue| {
                let mut kept = VecDeque::with_capacity(queue.entries.len());
                for entry in queue.entries.drain(..) {
                    match entry {
                        Entry::Waiting(call) if call.deadline <= now => {
                            kept.push_back(Entry::TimedOut {
                                id: call.id,
                                forget_at: deadline_after(call.deadline, call.timeout),
                            });
                            expired.push((key.clone(), call));
                        }
                        Entry::TimedOut { forget_at, .. } if forget_at <= now => forgotten += 1,
                        entry => kept.push_back(entry),
                    }
                }
                queue.entries = kept;
                !queue.entries.is_empty()
            });
            expired
        };

        if forgotten > 0 {
            tracing::debug!(forgotten, "forgot replies owed to timed-out calls");
        }

        expired
            .into_iter()
            .map(|(operation, call)| {
                let timeout = call.timeout;
                resolve(
                    call,
                    Err(BridgeError::Timeout {
                        operation: operation.clone(),
                        timeout,
                    }),
                );
                operation
            })
            .collect()
    }

    /// Resolve every waiting call with `Disposed` and forget all tombstones.
    /// Returns how many calls were drained.
    pub fn drain(&self) -> usize {
        let queues = std::mem::take(&mut self.state.lock().queues);
        let mut drained = 0;
        for (operation, queue) in queues {
            for entry in queue.entries {
                if let Entry::Waiting(call) = entry {
                    drained += 1;
                    resolve(
                        call,
                        Err(BridgeError::Disposed {
                            operation: operation.clone(),
                        }),
                    );
                }
            }
        }
        drained
    }

    /// Keys with at least one waiting call, in registration order.
    pub fn pending_keys(&self) -> Vec<String> {
        self.state.lock().keys_in_registration_order(true)
    }

    pub fn pending_for(&self, key: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(key)
            .map_or(0, KeyQueue::waiting)
    }

    /// Replies under `key` still owed to timed-out calls.
    pub fn owed_for(&self, key: &str) -> usize {
        self.state.lock().queues.get(key).map_or(0, |queue| {
            queue.entries.len() - queue.waiting()
        })
    }

    /// Number of waiting calls.
    pub fn len(&self) -> usize {
        self.state.lock().queues.values().map(KeyQueue::waiting).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `start + timeout`, clamped to roughly thirty years for unbounded timeouts.
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

fn deliver(entry: Entry, response: ParsedResponse) -> Completion {
    match entry {
        Entry::Waiting(call) => {
            resolve(call, Ok(response));
            Completion::Resolved
        }
        Entry::TimedOut { id, .. } => {
            tracing::debug!(call = %id, "late reply for timed-out call discarded");
            Completion::Discarded
        }
    }
}

fn resolve(call: PendingCall, result: CallResult) {
    if call.slot.send(result).is_err() {
        tracing::debug!(call = %call.id, "waiter abandoned before resolution");
    }
}
