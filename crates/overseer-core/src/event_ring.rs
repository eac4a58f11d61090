use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use overseer_types::{RunEvent, RunEventKind};

use crate::clock::SharedClock;

struct RingState {
    events: VecDeque<RunEvent>,
    next_seq: u64,
    closed: bool,
}

/// Events retained for a reader cursor, plus the gap it fell into, if any.
#[derive(Debug, Clone, Default)]
pub struct RingRead {
    pub gap: Option<RunEvent>,
    pub events: Vec<RunEvent>,
    pub closed: bool,
}

/// Bounded per-run event log. Appends never wait on readers; a reader whose
/// cursor has been overwritten gets a `gap_detected` event and resumes at the head.
pub struct EventRing {
    run_id: String,
    capacity: usize,
    clock: SharedClock,
    state: Mutex<RingState>,
    notify: watch::Sender<u64>,
}

impl EventRing {
    pub fn new(run_id: impl Into<String>, capacity: usize, clock: SharedClock) -> Self {
        let capacity = capacity.max(1);
        let (notify, _) = watch::channel(0);
        Self {
            run_id: run_id.into(),
            capacity,
            clock,
            state: Mutex::new(RingState {
                events: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
                closed: false,
            }),
            notify,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stamps the next sequence number and retains the event.
    pub fn append(&self, kind: RunEventKind, payload: Value) -> RunEvent {
        let event = {
            let mut state = self.state.lock();
            let event = RunEvent {
                run_id: self.run_id.clone(),
                sequence: state.next_seq,
                kind,
                payload,
                timestamp: self.clock.now(),
            };
            state.next_seq += 1;
            if state.events.len() >= self.capacity {
                state.events.pop_front();
            }
            state.events.push_back(event.clone());
            event
        };
        self.notify.send_replace(event.sequence);
        event
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Marks the log complete; open streams drain what is left and end.
    pub fn close(&self) {
        let last = {
            let mut state = self.state.lock();
            state.closed = true;
            state.next_seq - 1
        };
        self.notify.send_replace(last);
    }

    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.state.lock().events.iter().cloned().collect()
    }

    /// Retained events with `sequence > after_seq`.
    pub fn read_after(&self, after_seq: u64) -> RingRead {
        let state = self.state.lock();
        let head = state.events.front().map(|event| event.sequence);
        let gap = match head {
            Some(head) if head > after_seq + 1 => Some(RunEvent {
                run_id: self.run_id.clone(),
                sequence: head - 1,
                kind: RunEventKind::GapDetected,
                payload: json!({
                    "requestedAfter": after_seq,
                    "resumedAt": head,
                }),
                timestamp: self.clock.now(),
            }),
            _ => None,
        };
        let events = state
            .events
            .iter()
            .filter(|event| event.sequence > after_seq)
            .cloned()
            .collect();
        RingRead {
            gap,
            events,
            closed: state.closed,
        }
    }

    /// Live stream starting after `after_seq`. Ends once the ring is closed and drained.
    pub fn stream(
        self: &Arc<Self>,
        after_seq: u64,
    ) -> impl Stream<Item = RunEvent> + Send + 'static {
        let ring = Arc::clone(self);
        let mut rx = ring.notify.subscribe();
        async_stream::stream! {
            let mut cursor = after_seq;
            loop {
                rx.borrow_and_update();
                let read = ring.read_after(cursor);
                let drained = read.events.is_empty();
                if let Some(gap) = read.gap {
                    cursor = gap.sequence;
                    yield gap;
                }
                for event in read.events {
                    cursor = event.sequence;
                    yield event;
                }
                if drained {
                    if read.closed {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::StreamExt;
    use std::time::Duration;

    fn ring(capacity: usize) -> Arc<EventRing> {
        Arc::new(EventRing::new(
            "run_1",
            capacity,
            Arc::new(ManualClock::default()),
        ))
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let ring = ring(8);
        let first = ring.append(RunEventKind::RunCreated, json!({}));
        let second = ring.append(RunEventKind::RunStatus, json!({"status": "running"}));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(ring.last_seq(), 2);
        assert_eq!(ring.read_after(1).events, vec![second]);
    }

    #[test]
    fn wrapped_cursor_reports_gap_and_resumes_at_head() {
        let ring = ring(3);
        for _ in 0..5 {
            ring.append(RunEventKind::RunProgress, json!({}));
        }
        let read = ring.read_after(0);
        let gap = read.gap.expect("gap");
        assert_eq!(gap.kind, RunEventKind::GapDetected);
        assert_eq!(gap.sequence, 2);
        assert_eq!(gap.payload["resumedAt"], json!(3));
        let seqs: Vec<u64> = read.events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        assert!(ring.read_after(2).gap.is_none());
    }

    #[tokio::test]
    async fn stream_backfills_then_follows_until_closed() {
        let ring = ring(16);
        ring.append(RunEventKind::RunCreated, json!({}));
        let stream = ring.stream(0);
        let writer = Arc::clone(&ring);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer.append(RunEventKind::RunStatus, json!({"status": "running"}));
            writer.append(RunEventKind::ExecutionCompleted, json!({}));
            writer.close();
        });
        let events: Vec<RunEvent> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
            .await
            .expect("stream ends after close");
        producer.await.expect("producer");
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stream_on_closed_ring_with_gap_yields_control_event_first() {
        let ring = ring(2);
        for _ in 0..4 {
            ring.append(RunEventKind::RunProgress, json!({}));
        }
        ring.close();
        let events: Vec<RunEvent> = ring.stream(0).collect().await;
        let kinds: Vec<RunEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RunEventKind::GapDetected,
                RunEventKind::RunProgress,
                RunEventKind::RunProgress
            ]
        );
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }
}
