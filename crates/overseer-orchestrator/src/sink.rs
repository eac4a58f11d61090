use async_trait::async_trait;
use serde_json::json;

use overseer_core::EventBus;
use overseer_types::{EngineEvent, RunEvent};

use crate::traits::EventSink;

/// Forwards run events onto the in-process [`EventBus`] as `run.<kind>`.
#[derive(Clone)]
pub struct BusEventSink {
    bus: EventBus,
}

impl BusEventSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl EventSink for BusEventSink {
    async fn publish(&self, event: &RunEvent) -> anyhow::Result<()> {
        let receivers = self.bus.publish(EngineEvent::new(
            format!("run.{}", event.kind.as_str()),
            json!({
                "runID": event.run_id,
                "sequence": event.sequence,
                "timestamp": event.timestamp,
                "payload": event.payload,
            }),
        ));
        tracing::trace!("run event {} fanned out to {} receivers", event.sequence, receivers);
        Ok(())
    }
}

/// Drops every event. Used when nothing listens beyond the run's own ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: &RunEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use overseer_types::RunEventKind;

    #[tokio::test]
    async fn bus_sink_prefixes_event_type() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sink = BusEventSink::new(bus);
        sink.publish(&RunEvent {
            run_id: "run_1".into(),
            sequence: 4,
            kind: RunEventKind::StepCompleted,
            payload: json!({"stepIndex": 0}),
            timestamp: Utc::now(),
        })
        .await
        .expect("publish");

        let received = rx.recv().await.expect("event");
        assert_eq!(received.event_type, "run.step_completed");
        assert_eq!(received.properties["sequence"], 4);
        assert_eq!(received.properties["payload"]["stepIndex"], 0);
    }
}
