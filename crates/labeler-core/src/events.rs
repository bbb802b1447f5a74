//! Label events, envelope schema, and event bus for downstream notification.
//!
//! Downstream subsystems (change detection, caches, UI push) subscribe to the
//! [`EventBus`] and learn about freshly computed labels. Events are only
//! emitted after the recalculation transaction has committed, so a consumer
//! never observes values that are later rolled back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned event envelope wrapping a [`LabelEvent`].
///
/// ```text
/// {"event_id":"...","event_type":"labels.updated","occurred_at":"...","payload":{...}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g., `"labels.updated"`).
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Type of entity this event relates to.
    pub entity_type: &'static str,
    /// ID of the entity this event relates to.
    pub entity_id: String,
    /// Payload schema version.
    pub payload_version: u32,
    /// Domain-specific event data.
    pub payload: LabelEvent,
}

impl EventEnvelope {
    pub fn new(event: LabelEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            entity_type: event.entity_type(),
            entity_id: event.dataset_id().to_string(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Label Event (domain payloads)
// ============================================================================

/// Events published by the label engine.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"LabelsUpdated","dataset_id":1,"is_recalculation":false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum LabelEvent {
    /// Label values of a dataset were recomputed and committed.
    LabelsUpdated {
        dataset_id: i32,
        is_recalculation: bool,
    },
}

impl LabelEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LabelEvent::LabelsUpdated { .. } => "LabelsUpdated",
        }
    }

    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            LabelEvent::LabelsUpdated { .. } => "labels.updated",
        }
    }

    pub fn entity_type(&self) -> &'static str {
        "dataset"
    }

    pub fn dataset_id(&self) -> i32 {
        match self {
            LabelEvent::LabelsUpdated { dataset_id, .. } => *dataset_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for distributing label events.
///
/// Slow receivers that fall behind receive a `Lagged` error and miss events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Without subscribers the event is
    /// dropped.
    pub fn emit(&self, event: LabelEvent) {
        let envelope = EventEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================
