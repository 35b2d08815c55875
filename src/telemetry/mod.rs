//! 遥测模块：批处理生命周期事件的可选收集。
//!
//! Batch lifecycle events.
//!
//! Sinks are synchronous and called inline from dispatch and completion paths,
//! so an implementation must not block. Nothing is collected unless a sink is
//! installed on the batch builder.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchEvent`] | Typed lifecycle event |
//! | [`BatchEventSink`] | Trait for event destinations |
//! | [`NoopEventSink`] | Default sink (no collection) |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for testing |
//! | [`TracingEventSink`] | Forwards events to `tracing` at debug level |
//! | [`CompositeEventSink`] | Multi-destination composite sink |

use crate::batch::{OperationId, Outcome};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        batch_id: Uuid,
        total: usize,
        limit: usize,
    },
    Dispatched {
        batch_id: Uuid,
        id: OperationId,
    },
    Completed {
        batch_id: Uuid,
        id: OperationId,
        outcome: Outcome,
    },
    Cancelled {
        batch_id: Uuid,
        id: OperationId,
    },
    Drained {
        batch_id: Uuid,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> Uuid {
        match self {
            BatchEvent::Started { batch_id, .. }
            | BatchEvent::Dispatched { batch_id, .. }
            | BatchEvent::Completed { batch_id, .. }
            | BatchEvent::Cancelled { batch_id, .. }
            | BatchEvent::Drained { batch_id, .. } => *batch_id,
        }
    }

    pub fn operation(&self) -> Option<OperationId> {
        match self {
            BatchEvent::Dispatched { id, .. }
            | BatchEvent::Completed { id, .. }
            | BatchEvent::Cancelled { id, .. } => Some(*id),
            _ => None,
        }
    }
}

pub trait BatchEventSink: Send + Sync {
    fn report(&self, event: &BatchEvent);
}

pub struct NoopEventSink;

impl BatchEventSink for NoopEventSink {
    fn report(&self, _event: &BatchEvent) {}
}

pub fn noop_sink() -> Arc<dyn BatchEventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink for testing. Keeps the newest `max_events`.
pub struct InMemoryEventSink {
    events: RwLock<Vec<BatchEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }
    pub fn events(&self) -> Vec<BatchEvent> {
        self.events
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
    pub fn events_for(&self, id: OperationId) -> Vec<BatchEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.operation() == Some(id))
            .collect()
    }
    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn clear(&self) {
        if let Ok(mut e) = self.events.write() {
            e.clear();
        }
    }
}

impl BatchEventSink for InMemoryEventSink {
    fn report(&self, event: &BatchEvent) {
        if let Ok(mut events) = self.events.write() {
            events.push(event.clone());
            if events.len() > self.max_events {
                events.remove(0);
            }
        }
    }
}

pub struct TracingEventSink;

impl BatchEventSink for TracingEventSink {
    fn report(&self, event: &BatchEvent) {
        tracing::debug!(batch_id = %event.batch_id(), ?event, "batch event");
    }
}

/// Composite sink for multiple destinations.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn BatchEventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }
    pub fn add_sink(mut self, sink: Arc<dyn BatchEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchEventSink for CompositeEventSink {
    fn report(&self, event: &BatchEvent) {
        for s in &self.sinks {
            s.report(event);
        }
    }
}
