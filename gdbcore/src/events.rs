/// Async event bus and status notifications
///
/// Every subscriber owns a bounded queue, so a slow consumer loses lines
/// instead of stalling the observer. Status changes and process exit are
/// published as counters on watch channels; waiting means waiting for the
/// counter to move past the value seen when the wait began.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

use crate::lock;
use crate::types::InferiorStatus;

pub type SubscriptionId = u64;

/// Fan-out of passive debugger output
pub struct EventBus {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a new independent queue
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel(self.capacity);
        lock(&self.subscribers).insert(id, sender);
        log::debug!("event bus: subscriber {} added", id);
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.subscribers).remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Hand `line` to every subscriber without blocking
    pub fn broadcast(&self, line: &str) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, sender| match sender.try_send(line.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("event bus: subscriber {} is full, dropping line", id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("event bus: subscriber {} closed", id);
                false
            }
        });
    }
}

/// One-shot waits for status changes and process exit
pub struct StatusNotifier {
    status_changes: watch::Sender<u64>,
    exits: watch::Sender<u64>,
    status: watch::Sender<InferiorStatus>,
}

impl Default for StatusNotifier {
    fn default() -> Self {
        StatusNotifier {
            status_changes: watch::channel(0).0,
            exits: watch::channel(0).0,
            status: watch::channel(InferiorStatus::Uninitialized).0,
        }
    }
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> InferiorStatus {
        *self.status.borrow()
    }

    /// Record the current status without telling external subscribers
    pub(crate) fn set_status(&self, status: InferiorStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn notify_status_change(&self) {
        self.status_changes.send_modify(|n| *n += 1);
    }

    pub(crate) fn notify_process_exit(&self) {
        self.exits.send_modify(|n| *n += 1);
    }

    /// Handle that resolves on the next externally visible status change
    pub fn status_change(&self) -> Waiter {
        Waiter::new(self.status_changes.subscribe())
    }

    /// Handle that resolves when the inferior exits or the debugger dies
    pub fn process_exit(&self) -> Waiter {
        Waiter::new(self.exits.subscribe())
    }

    /// Receiver that follows the raw inferior status
    pub fn status_receiver(&self) -> watch::Receiver<InferiorStatus> {
        self.status.subscribe()
    }
}

/// A subscribe-once wait; only events after creation count
pub struct Waiter {
    receiver: watch::Receiver<u64>,
}

impl Waiter {
    fn new(mut receiver: watch::Receiver<u64>) -> Self {
        receiver.borrow_and_update();
        Waiter { receiver }
    }

    /// Resolves to false if the notifier is gone
    pub async fn wait(mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }
}
