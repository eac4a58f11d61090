use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use overseer_types::{
    AsyncCompletionEvent, AsyncOperation, AsyncOperationStatus, AsyncStatusUpdate,
};

use crate::clock::{elapsed_between, to_chrono, SharedClock};
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub update_buffer: usize,
    pub completion_buffer: usize,
    pub slow_subscriber_timeout: Duration,
    pub retention_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for TrackerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            update_buffer: config.subscriber_update_buffer.max(1),
            completion_buffer: config.subscriber_completion_buffer.max(1),
            slow_subscriber_timeout: config.slow_subscriber_timeout(),
            retention_window: config.async_retention_window(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrackerError {
    #[error("operation already tracked: {0}")]
    Duplicate(String),
    #[error("operation not found: {0}")]
    NotFound(String),
    #[error("operation already terminal: {0}")]
    AlreadyTerminal(String),
    #[error("status '{}' is not terminal", .0.as_str())]
    InvalidStatus(AsyncOperationStatus),
}

/// Which operations a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Operation(String),
    Chat(String),
}

impl SubscriptionFilter {
    fn matches(&self, op: &AsyncOperation) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Operation(id) => *id == op.tool_call_id,
            SubscriptionFilter::Chat(chat_id) => *chat_id == op.chat_id,
        }
    }
}

#[derive(Default)]
struct SubscriberQueues {
    updates: VecDeque<AsyncStatusUpdate>,
    completions: VecDeque<AsyncCompletionEvent>,
    dropped: u64,
    reads: u64,
    stall_armed: bool,
    closed: bool,
}

struct SubscriberSlot {
    id: u64,
    filter: SubscriptionFilter,
    queues: Mutex<SubscriberQueues>,
    update_ready: Notify,
    completion_ready: Notify,
}

impl SubscriberSlot {
    fn is_closed(&self) -> bool {
        self.queues.lock().closed
    }

    fn close(&self) {
        {
            let mut queues = self.queues.lock();
            queues.closed = true;
            queues.updates.clear();
            queues.completions.clear();
        }
        self.update_ready.notify_one();
        self.completion_ready.notify_one();
    }
}

struct TrackedOperation {
    op: AsyncOperation,
    cancel: CancellationToken,
    completion: Option<AsyncCompletionEvent>,
}

#[derive(Default)]
struct TrackerState {
    operations: HashMap<String, TrackedOperation>,
    subscribers: Vec<Arc<SubscriberSlot>>,
}

struct TrackerShared {
    config: TrackerConfig,
    clock: SharedClock,
    state: Mutex<TrackerState>,
    next_subscriber: AtomicU64,
}

/// In-memory registry of async tool-call operations with per-subscriber fan-out.
///
/// All mutations and their deliveries happen under one lock, so every
/// subscriber observes updates for an operation in acceptance order and the
/// single completion strictly after its terminal update.
#[derive(Clone)]
pub struct AsyncTracker {
    shared: Arc<TrackerShared>,
}

impl AsyncTracker {
    pub fn new(config: TrackerConfig, clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                config,
                clock,
                state: Mutex::new(TrackerState::default()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.shared.config
    }

    pub fn start(
        &self,
        tool_call_id: &str,
        chat_id: &str,
        tool_name: &str,
        scenario: &str,
        initial_result: Option<Value>,
    ) -> Result<AsyncOperation, TrackerError> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        if let Some(existing) = state.operations.get(tool_call_id) {
            if !existing.op.is_terminal() {
                return Err(TrackerError::Duplicate(tool_call_id.to_string()));
            }
        }

        let update = AsyncStatusUpdate {
            tool_call_id: tool_call_id.to_string(),
            status: AsyncOperationStatus::Pending,
            progress: None,
            message: None,
            data: None,
            is_terminal: false,
            timestamp: now,
        };
        let op = AsyncOperation {
            tool_call_id: tool_call_id.to_string(),
            chat_id: chat_id.to_string(),
            tool_name: tool_name.to_string(),
            scenario: scenario.to_string(),
            status: AsyncOperationStatus::Pending,
            started_at: now,
            updated_at: now,
            terminal_at: None,
            last_update: Some(update.clone()),
            result: initial_result,
            error: None,
        };
        state.operations.insert(
            tool_call_id.to_string(),
            TrackedOperation {
                op: op.clone(),
                cancel: CancellationToken::new(),
                completion: None,
            },
        );
        tracing::debug!("tracking async operation {} ({})", tool_call_id, tool_name);
        self.deliver_update(&mut state, &op, update);
        Ok(op)
    }

    /// Records progress. Returns `Ok(false)` when the operation is already terminal.
    pub fn update(
        &self,
        tool_call_id: &str,
        progress: Option<f64>,
        message: Option<String>,
        data: Option<Value>,
    ) -> Result<bool, TrackerError> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        let Some(entry) = state.operations.get_mut(tool_call_id) else {
            return Err(TrackerError::NotFound(tool_call_id.to_string()));
        };
        if entry.op.is_terminal() {
            return Ok(false);
        }
        if entry.op.status == AsyncOperationStatus::Pending {
            entry.op.status = AsyncOperationStatus::Running;
        }
        let update = AsyncStatusUpdate {
            tool_call_id: tool_call_id.to_string(),
            status: entry.op.status,
            progress,
            message,
            data,
            is_terminal: false,
            timestamp: now,
        };
        entry.op.updated_at = now;
        entry.op.last_update = Some(update.clone());
        let op = entry.op.clone();
        self.deliver_update(&mut state, &op, update);
        Ok(true)
    }

    /// Moves the operation to `final_status`. Only the first caller wins; later
    /// calls return `Ok(false)` and emit nothing.
    pub fn complete(
        &self,
        tool_call_id: &str,
        final_status: AsyncOperationStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, TrackerError> {
        if !final_status.is_terminal() {
            return Err(TrackerError::InvalidStatus(final_status));
        }
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        let Some(entry) = state.operations.get_mut(tool_call_id) else {
            return Err(TrackerError::NotFound(tool_call_id.to_string()));
        };
        if entry.op.is_terminal() {
            return Ok(false);
        }

        let update = AsyncStatusUpdate {
            tool_call_id: tool_call_id.to_string(),
            status: final_status,
            progress: (final_status == AsyncOperationStatus::Succeeded).then_some(1.0),
            message: error.clone(),
            data: None,
            is_terminal: true,
            timestamp: now,
        };
        let completion = AsyncCompletionEvent {
            tool_call_id: tool_call_id.to_string(),
            final_status,
            result: result.clone().or_else(|| entry.op.result.clone()),
            error: error.clone(),
            duration_ms: elapsed_between(entry.op.started_at, now).as_millis() as u64,
        };
        entry.op.status = final_status;
        entry.op.updated_at = now;
        entry.op.terminal_at = Some(now);
        entry.op.last_update = Some(update.clone());
        if result.is_some() {
            entry.op.result = result;
        }
        entry.op.error = error;
        entry.completion = Some(completion.clone());
        let op = entry.op.clone();

        self.deliver_update(&mut state, &op, update);
        self.deliver_completion(&mut state, &op, completion);
        tracing::debug!(
            "async operation {} finished as {}",
            tool_call_id,
            final_status.as_str()
        );
        Ok(true)
    }

    /// Signals the executor and publishes a `cancelling` update. The executor
    /// still owns the completion.
    pub fn cancel(&self, tool_call_id: &str) -> Result<(), TrackerError> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        let Some(entry) = state.operations.get_mut(tool_call_id) else {
            return Err(TrackerError::NotFound(tool_call_id.to_string()));
        };
        if entry.op.is_terminal() {
            return Err(TrackerError::AlreadyTerminal(tool_call_id.to_string()));
        }
        entry.cancel.cancel();
        if entry.op.status == AsyncOperationStatus::Cancelling {
            return Ok(());
        }
        let update = AsyncStatusUpdate {
            tool_call_id: tool_call_id.to_string(),
            status: AsyncOperationStatus::Cancelling,
            progress: None,
            message: None,
            data: None,
            is_terminal: false,
            timestamp: now,
        };
        entry.op.status = AsyncOperationStatus::Cancelling;
        entry.op.updated_at = now;
        entry.op.last_update = Some(update.clone());
        let op = entry.op.clone();
        self.deliver_update(&mut state, &op, update);
        Ok(())
    }

    pub fn cancellation_token(&self, tool_call_id: &str) -> Option<CancellationToken> {
        self.shared
            .state
            .lock()
            .operations
            .get(tool_call_id)
            .map(|entry| entry.cancel.clone())
    }

    pub fn get(&self, tool_call_id: &str) -> Option<AsyncOperation> {
        self.shared
            .state
            .lock()
            .operations
            .get(tool_call_id)
            .map(|entry| entry.op.clone())
    }

    pub fn list(&self, chat_id: Option<&str>) -> Vec<AsyncOperation> {
        let mut ops: Vec<AsyncOperation> = self
            .shared
            .state
            .lock()
            .operations
            .values()
            .filter(|entry| chat_id.map_or(true, |chat| entry.op.chat_id == chat))
            .map(|entry| entry.op.clone())
            .collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ops
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let slot = Arc::new(SubscriberSlot {
            id: self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed),
            filter,
            queues: Mutex::new(SubscriberQueues::default()),
            update_ready: Notify::new(),
            completion_ready: Notify::new(),
        });

        let mut state = self.shared.state.lock();
        if let SubscriptionFilter::Operation(id) = &slot.filter {
            if let Some(entry) = state.operations.get(id) {
                if let (Some(update), Some(completion)) =
                    (entry.op.last_update.clone(), entry.completion.clone())
                {
                    let mut queues = slot.queues.lock();
                    queues.updates.push_back(update);
                    queues.completions.push_back(completion);
                }
            }
        }
        state.subscribers.push(Arc::clone(&slot));

        Subscription {
            slot,
            tracker: Arc::downgrade(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .subscribers
            .iter()
            .filter(|slot| !slot.is_closed())
            .count()
    }

    /// Evicts terminal operations older than the retention window.
    pub fn sweep_expired(&self) -> usize {
        let now = self.shared.clock.now();
        let retention = to_chrono(self.shared.config.retention_window);
        let mut state = self.shared.state.lock();
        let before = state.operations.len();
        state.operations.retain(|_, entry| match entry.op.terminal_at {
            Some(terminal_at) => terminal_at + retention > now,
            None => true,
        });
        let evicted = before - state.operations.len();
        if evicted > 0 {
            tracing::debug!("evicted {} retained async operations", evicted);
        }
        evicted
    }

    pub fn spawn_janitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tracker.shared.clock.timer(interval) => {
                        tracker.sweep_expired();
                    }
                }
            }
        })
    }

    fn deliver_update(
        &self,
        state: &mut TrackerState,
        op: &AsyncOperation,
        update: AsyncStatusUpdate,
    ) {
        let capacity = self.shared.config.update_buffer;
        state.subscribers.retain(|slot| !slot.is_closed());
        for slot in state.subscribers.iter().filter(|slot| slot.filter.matches(op)) {
            let stalled = {
                let mut queues = slot.queues.lock();
                let mut overflowed = false;
                if queues.updates.len() >= capacity {
                    queues.updates.pop_front();
                    queues.dropped += 1;
                    overflowed = true;
                }
                queues.updates.push_back(update.clone());
                self.arm_if_stalled(&mut queues, overflowed)
            };
            slot.update_ready.notify_one();
            if let Some(reads) = stalled {
                self.spawn_stall_watchdog(slot, reads);
            }
        }
    }

    fn deliver_completion(
        &self,
        state: &mut TrackerState,
        op: &AsyncOperation,
        completion: AsyncCompletionEvent,
    ) {
        let capacity = self.shared.config.completion_buffer;
        for slot in state.subscribers.iter().filter(|slot| slot.filter.matches(op)) {
            let stalled = {
                let mut queues = slot.queues.lock();
                if queues.closed {
                    continue;
                }
                let over = queues.completions.len() >= capacity;
                queues.completions.push_back(completion.clone());
                self.arm_if_stalled(&mut queues, over)
            };
            slot.completion_ready.notify_one();
            if let Some(reads) = stalled {
                self.spawn_stall_watchdog(slot, reads);
            }
        }
    }

    fn arm_if_stalled(&self, queues: &mut SubscriberQueues, pressured: bool) -> Option<u64> {
        if !pressured || queues.stall_armed {
            return None;
        }
        queues.stall_armed = true;
        Some(queues.reads)
    }

    /// Disconnects the subscriber unless it reads something before the slow-subscriber timeout.
    fn spawn_stall_watchdog(&self, slot: &Arc<SubscriberSlot>, reads_at_arm: u64) {
        let timer: BoxFuture<'static, ()> =
            self.shared.clock.timer(self.shared.config.slow_subscriber_timeout);
        let slot = Arc::clone(slot);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime for slow-subscriber watchdog; subscriber {} unguarded", slot.id);
            slot.queues.lock().stall_armed = false;
            return;
        };
        handle.spawn(async move {
            timer.await;
            let stalled = {
                let mut queues = slot.queues.lock();
                queues.stall_armed = false;
                !queues.closed && queues.reads == reads_at_arm
            };
            if stalled {
                tracing::warn!(
                    "disconnecting slow async subscriber {} after no reads",
                    slot.id
                );
                slot.close();
            }
        });
    }
}

/// Receiving side of a tracker subscription. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
    tracker: Weak<TrackerShared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.slot.filter
    }

    /// Next status update; `None` once the subscription is closed.
    pub async fn next_update(&mut self) -> Option<AsyncStatusUpdate> {
        loop {
            {
                let mut queues = self.slot.queues.lock();
                if let Some(update) = queues.updates.pop_front() {
                    queues.reads += 1;
                    return Some(update);
                }
                if queues.closed {
                    return None;
                }
            }
            self.slot.update_ready.notified().await;
        }
    }

    /// Next completion event; `None` once the subscription is closed.
    pub async fn next_completion(&mut self) -> Option<AsyncCompletionEvent> {
        loop {
            {
                let mut queues = self.slot.queues.lock();
                if let Some(completion) = queues.completions.pop_front() {
                    queues.reads += 1;
                    return Some(completion);
                }
                if queues.closed {
                    return None;
                }
            }
            self.slot.completion_ready.notified().await;
        }
    }

    pub fn try_next_update(&mut self) -> Option<AsyncStatusUpdate> {
        let mut queues = self.slot.queues.lock();
        let update = queues.updates.pop_front();
        if update.is_some() {
            queues.reads += 1;
        }
        update
    }

    pub fn try_next_completion(&mut self) -> Option<AsyncCompletionEvent> {
        let mut queues = self.slot.queues.lock();
        let completion = queues.completions.pop_front();
        if completion.is_some() {
            queues.reads += 1;
        }
        completion
    }

    /// Updates discarded for this subscriber because its buffer was full.
    pub fn dropped(&self) -> u64 {
        self.slot.queues.lock().dropped
    }

    pub fn pending_updates(&self) -> usize {
        self.slot.queues.lock().updates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close();
        if let Some(shared) = self.tracker.upgrade() {
            let id = self.slot.id;
            shared.state.lock().subscribers.retain(|slot| slot.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn tracker() -> (ManualClock, AsyncTracker) {
        let clock = ManualClock::default();
        let config = TrackerConfig {
            update_buffer: 16,
            completion_buffer: 4,
            slow_subscriber_timeout: Duration::from_secs(5),
            retention_window: Duration::from_secs(600),
        };
        let tracker = AsyncTracker::new(config, Arc::new(clock.clone()));
        (clock, tracker)
    }

    #[test]
    fn start_rejects_live_duplicates_but_replaces_terminal_entries() {
        let (_clock, tracker) = tracker();
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        assert_eq!(
            tracker.start("t1", "chat", "tool", "inbox", None),
            Err(TrackerError::Duplicate("t1".to_string()))
        );
        tracker
            .complete("t1", AsyncOperationStatus::Failed, None, Some("boom".into()))
            .expect("complete");
        let restarted = tracker.start("t1", "chat", "tool", "inbox", None).expect("restart");
        assert_eq!(restarted.status, AsyncOperationStatus::Pending);
    }

    #[test]
    fn lifecycle_is_delivered_in_order() {
        let (clock, tracker) = tracker();
        let mut sub = tracker.subscribe(SubscriptionFilter::Operation("t1".into()));
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        tracker
            .update("t1", Some(0.5), Some("halfway".into()), None)
            .expect("update");
        clock.advance(Duration::from_millis(1500));
        assert!(tracker
            .complete("t1", AsyncOperationStatus::Succeeded, Some(json!({"ok": true})), None)
            .expect("complete"));

        let statuses: Vec<AsyncOperationStatus> = std::iter::from_fn(|| sub.try_next_update())
            .map(|u| u.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                AsyncOperationStatus::Pending,
                AsyncOperationStatus::Running,
                AsyncOperationStatus::Succeeded
            ]
        );
        let completion = sub.try_next_completion().expect("completion");
        assert_eq!(completion.duration_ms, 1500);
        assert_eq!(completion.result, Some(json!({"ok": true})));
        assert!(sub.try_next_completion().is_none());
    }

    #[test]
    fn terminal_operations_ignore_updates_and_second_completion() {
        let (_clock, tracker) = tracker();
        let mut sub = tracker.subscribe(SubscriptionFilter::All);
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        assert!(tracker
            .complete("t1", AsyncOperationStatus::Succeeded, None, None)
            .expect("first"));
        assert!(!tracker
            .complete("t1", AsyncOperationStatus::Failed, None, None)
            .expect("second"));
        assert_eq!(tracker.update("t1", Some(0.9), None, None), Ok(false));
        assert_eq!(
            tracker.update("missing", None, None, None),
            Err(TrackerError::NotFound("missing".into()))
        );
        assert_eq!(
            tracker.complete("t1", AsyncOperationStatus::Running, None, None),
            Err(TrackerError::InvalidStatus(AsyncOperationStatus::Running))
        );

        let updates: Vec<_> = std::iter::from_fn(|| sub.try_next_update()).collect();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].is_terminal);
        assert!(sub.try_next_completion().is_some());
        assert!(sub.try_next_completion().is_none());
    }

    #[test]
    fn cancel_signals_token_and_emits_cancelling_once() {
        let (_clock, tracker) = tracker();
        let mut sub = tracker.subscribe(SubscriptionFilter::Chat("chat".into()));
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        let token = tracker.cancellation_token("t1").expect("token");
        tracker.cancel("t1").expect("cancel");
        tracker.cancel("t1").expect("repeat cancel");
        assert!(token.is_cancelled());
        assert_eq!(
            tracker.get("t1").map(|op| op.status),
            Some(AsyncOperationStatus::Cancelling)
        );

        tracker
            .complete("t1", AsyncOperationStatus::Cancelled, None, None)
            .expect("complete");
        assert_eq!(
            tracker.cancel("t1"),
            Err(TrackerError::AlreadyTerminal("t1".into()))
        );
        let statuses: Vec<_> = std::iter::from_fn(|| sub.try_next_update())
            .map(|u| u.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                AsyncOperationStatus::Pending,
                AsyncOperationStatus::Cancelling,
                AsyncOperationStatus::Cancelled
            ]
        );
    }

    #[test]
    fn filters_route_by_operation_and_chat() {
        let (_clock, tracker) = tracker();
        let mut chat_a = tracker.subscribe(SubscriptionFilter::Chat("a".into()));
        let mut op_b = tracker.subscribe(SubscriptionFilter::Operation("t2".into()));
        tracker.start("t1", "a", "tool", "inbox", None).expect("t1");
        tracker.start("t2", "b", "tool", "inbox", None).expect("t2");
        assert_eq!(chat_a.try_next_update().map(|u| u.tool_call_id), Some("t1".into()));
        assert!(chat_a.try_next_update().is_none());
        assert_eq!(op_b.try_next_update().map(|u| u.tool_call_id), Some("t2".into()));
        assert_eq!(tracker.list(Some("a")).len(), 1);
        assert_eq!(tracker.list(None).len(), 2);
    }

    #[test]
    fn late_subscriber_to_retained_operation_gets_replay() {
        let (_clock, tracker) = tracker();
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        tracker
            .complete("t1", AsyncOperationStatus::TimedOut, None, None)
            .expect("complete");
        let mut late = tracker.subscribe(SubscriptionFilter::Operation("t1".into()));
        let update = late.try_next_update().expect("terminal update");
        assert!(update.is_terminal);
        assert_eq!(
            late.try_next_completion().map(|c| c.final_status),
            Some(AsyncOperationStatus::TimedOut)
        );
    }

    #[test]
    fn overflow_drops_oldest_update() {
        let (_clock, tracker) = tracker();
        let mut sub = tracker.subscribe(SubscriptionFilter::All);
        tracker.start("t1", "chat", "tool", "inbox", None).expect("start");
        for i in 0..20 {
            tracker
                .update("t1", Some(i as f64), None, None)
                .expect("update");
        }
        assert_eq!(sub.dropped(), 5);
        let first = sub.try_next_update().expect("oldest retained");
        assert_eq!(first.progress, Some(4.0));
    }

    #[test]
    fn sweep_evicts_after_retention_window() {
        let (clock, tracker) = tracker();
        tracker.start("t1", "chat", "tool", "inbox", None).expect("t1");
        tracker.start("t2", "chat", "tool", "inbox", None).expect("t2");
        tracker
            .complete("t1", AsyncOperationStatus::Succeeded, None, None)
            .expect("complete");
        clock.advance(Duration::from_secs(599));
        assert_eq!(tracker.sweep_expired(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(tracker.sweep_expired(), 1);
        assert!(tracker.get("t1").is_none());
        assert!(tracker.get("t2").is_some());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let (_clock, tracker) = tracker();
        let sub = tracker.subscribe(SubscriptionFilter::All);
        assert_eq!(tracker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
