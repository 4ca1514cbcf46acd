//! Event Publisher Adapter.
//!
//! Publishing is fire-and-forget from the caller's perspective: envelopes are
//! queued onto a bounded channel and a dedicated drain task delivers them to
//! the registered sinks. A sink failure is logged at warning level with the
//! event type and session context and never propagates back to the loop.
//!
//! Back-pressure policy: the producer awaits the bounded send instead of
//! dropping, so ordering within a session/step is preserved and no event is
//! lost while the drain is alive.
//!
//! Besides the registered sinks, every delivered envelope is re-broadcast on
//! an [`InMemoryBus`]; `subscribe()` hands out receivers for observers that
//! prefer pulling a stream over implementing a sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use taskloop_core_types::{SessionId, TaskLoopError};

use crate::envelope::{TaskLoopEvent, TaskLoopEventType};
use crate::{EventBus, InMemoryBus};

/// Downstream observer of the event stream (WebSocket fan-out, log recorder,
/// test collector). Delivery failures are the sink's own problem to report.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &TaskLoopEvent) -> Result<(), TaskLoopError>;
}

/// Ordered, failure-tolerant publisher of [`TaskLoopEvent`] envelopes.
pub struct EventPublisher {
    sender: Mutex<Option<mpsc::Sender<TaskLoopEvent>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    bus: Arc<InMemoryBus<TaskLoopEvent>>,
}

impl EventPublisher {
    /// Spawn the drain task and return the publisher handle.
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<TaskLoopEvent>(capacity.max(1));
        let bus = InMemoryBus::new(capacity.max(1));
        let fanout = bus.clone();
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(err) = sink.deliver(&event).await {
                        warn!(
                            event_type = ?event.event_type,
                            session = %event.session_id,
                            "event delivery failed: {err}"
                        );
                    }
                }
                if let Err(err) = fanout.publish(event).await {
                    warn!("event broadcast failed: {}", err.log_line());
                }
            }
            debug!("event publisher drain finished");
        });
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
            bus,
        })
    }

    /// Receiver over the delivered event stream. A subscriber that falls
    /// behind loses old events; the sink path is the lossless one.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskLoopEvent> {
        self.bus.subscribe()
    }

    /// Publisher with no sinks; events are drained and discarded.
    pub fn disabled() -> Arc<Self> {
        Self::new(1, Vec::new())
    }

    /// Capture an envelope (fresh id, capture-time timestamp) and queue it.
    pub async fn publish(
        &self,
        event_type: TaskLoopEventType,
        session_id: SessionId,
        step_index: Option<u32>,
        payload: serde_json::Value,
    ) {
        let event = TaskLoopEvent::capture(event_type, session_id, step_index, payload);
        let sender = { self.sender.lock().await.clone() };
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    warn!(event_type = ?event_type, "event queue closed, event discarded");
                }
            }
            None => {
                warn!(event_type = ?event_type, "publisher shut down, event discarded");
            }
        }
    }

    /// Lightweight progress marker for phase transitions.
    pub async fn publish_progress(
        &self,
        session_id: SessionId,
        step_index: u32,
        phase: impl Into<String>,
        iteration: u32,
    ) {
        self.publish(
            TaskLoopEventType::ProgressUpdate,
            session_id,
            Some(step_index),
            serde_json::json!({ "phase": phase.into(), "iteration": iteration }),
        )
        .await;
    }

    /// Close the queue and join the drain, guaranteeing every queued event was
    /// offered to every sink. Idempotent.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let handle = { self.drain.lock().await.take() };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("event publisher drain join failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    struct Collecting {
        events: SyncMutex<Vec<TaskLoopEvent>>,
    }

    #[async_trait]
    impl EventSink for Collecting {
        async fn deliver(&self, event: &TaskLoopEvent) -> Result<(), TaskLoopError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct AlwaysFailing;

    #[async_trait]
    impl EventSink for AlwaysFailing {
        async fn deliver(&self, _event: &TaskLoopEvent) -> Result<(), TaskLoopError> {
            Err(TaskLoopError::internal("observer down"))
        }
    }

    #[tokio::test]
    async fn preserves_publish_order_per_session() {
        let sink = Arc::new(Collecting {
            events: SyncMutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(4, vec![sink.clone()]);
        let session = SessionId::new();

        publisher
            .publish(
                TaskLoopEventType::StepStarted,
                session.clone(),
                Some(0),
                serde_json::json!({}),
            )
            .await;
        publisher
            .publish_progress(session.clone(), 0, "querying_reasoner", 1)
            .await;
        publisher
            .publish(
                TaskLoopEventType::StepCompleted,
                session.clone(),
                Some(0),
                serde_json::json!({}),
            )
            .await;
        publisher.shutdown().await;

        let events = sink.events.lock();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                TaskLoopEventType::StepStarted,
                TaskLoopEventType::ProgressUpdate,
                TaskLoopEventType::StepCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let good = Arc::new(Collecting {
            events: SyncMutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(4, vec![Arc::new(AlwaysFailing), good.clone()]);
        let session = SessionId::new();

        publisher
            .publish(
                TaskLoopEventType::CommandExecuted,
                session,
                Some(2),
                serde_json::json!({ "command": "CLICK_ELEMENT" }),
            )
            .await;
        publisher.shutdown().await;

        assert_eq!(good.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_receive_the_delivered_stream_in_order() {
        let publisher = EventPublisher::new(8, Vec::new());
        let mut stream = publisher.subscribe();
        let session = SessionId::new();

        publisher
            .publish(
                TaskLoopEventType::StepStarted,
                session.clone(),
                Some(0),
                serde_json::json!({}),
            )
            .await;
        publisher
            .publish_progress(session.clone(), 0, "querying_reasoner", 1)
            .await;
        publisher.shutdown().await;

        assert_eq!(
            stream.recv().await.unwrap().event_type,
            TaskLoopEventType::StepStarted
        );
        let progress = stream.recv().await.unwrap();
        assert_eq!(progress.event_type, TaskLoopEventType::ProgressUpdate);
        assert_eq!(progress.session_id, session);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_silent() {
        let publisher = EventPublisher::disabled();
        publisher.shutdown().await;
        publisher
            .publish(
                TaskLoopEventType::ProgressUpdate,
                SessionId::new(),
                None,
                serde_json::json!({}),
            )
            .await;
    }
}
