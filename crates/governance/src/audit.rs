//! Observability sinks for policy and admission events.
//!
//! The gateway emits every decision through the [`EventEmitter`] seam. The
//! in-memory sink keeps a bounded window for the dashboard feed; nothing here
//! is long-term audit storage.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use switchboard_core::{
    events::{EventEnvelope, EventSeverity, EventType},
    traits::EventEmitter,
};

/// Filter for querying recent events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub agent_id: Option<String>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
}

/// Bounded ring buffer of recent events.
pub struct InMemoryEventSink {
    entries: Mutex<VecDeque<EventEnvelope>>,
    capacity: usize,
}

impl InMemoryEventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EventEnvelope>> {
        // A panic while holding the lock cannot leave the deque half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Most recent events first.
    pub fn query(&self, filter: &EventFilter) -> Vec<EventEnvelope> {
        let entries = self.lock();
        let matching = entries.iter().rev().filter(|e| {
            filter.event_type.map_or(true, |t| e.event_type == t)
                && filter.agent_id.as_ref().map_or(true, |a| &e.agent_id == a)
                && filter
                    .correlation_id
                    .as_ref()
                    .map_or(true, |c| &e.correlation_id == c)
        });
        match filter.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl EventEmitter for InMemoryEventSink {
    async fn emit(&self, event: EventEnvelope) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }
}

/// Writes every event to the log.
pub struct TracingEventEmitter;

#[async_trait]
impl EventEmitter for TracingEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        let payload = event.payload.to_string();
        match event.severity {
            EventSeverity::Error => tracing::error!(
                target: "switchboard::events",
                event_type = ?event.event_type,
                correlation_id = %event.correlation_id,
                agent_id = %event.agent_id,
                payload = %payload,
                "event"
            ),
            EventSeverity::Warning => tracing::warn!(
                target: "switchboard::events",
                event_type = ?event.event_type,
                correlation_id = %event.correlation_id,
                agent_id = %event.agent_id,
                payload = %payload,
                "event"
            ),
            _ => tracing::info!(
                target: "switchboard::events",
                event_type = ?event.event_type,
                correlation_id = %event.correlation_id,
                agent_id = %event.agent_id,
                payload = %payload,
                "event"
            ),
        }
    }
}

/// Forwards each event to several sinks.
#[derive(Default)]
pub struct FanoutEmitter {
    sinks: Vec<Arc<dyn EventEmitter>>,
}

impl FanoutEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to the fan-out.
    pub fn add(mut self, sink: Arc<dyn EventEmitter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventEmitter for FanoutEmitter {
    async fn emit(&self, event: EventEnvelope) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}
