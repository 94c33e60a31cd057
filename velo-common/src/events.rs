//! Event types for the velo sync event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Sync lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// A sync run started executing
    SyncRunStarted {
        run_id: Uuid,
        job_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A sync run completed (success or partial)
    SyncRunCompleted {
        run_id: Uuid,
        job_type: String,
        status: String,
        items_processed: u64,
        items_new: u64,
        items_updated: u64,
        error_count: u64,
        timestamp: DateTime<Utc>,
    },

    /// A sync run failed outright
    SyncRunFailed {
        run_id: Uuid,
        job_type: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The scheduler installed its periodic triggers
    SchedulerStarted {
        jobs: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The scheduler cancelled all triggers
    SchedulerStopped { timestamp: DateTime<Utc> },
}

impl SyncEvent {
    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncRunStarted { .. } => "SyncRunStarted",
            SyncEvent::SyncRunCompleted { .. } => "SyncRunCompleted",
            SyncEvent::SyncRunFailed { .. } => "SyncRunFailed",
            SyncEvent::SchedulerStarted { .. } => "SchedulerStarted",
            SyncEvent::SchedulerStopped { .. } => "SchedulerStopped",
        }
    }
}

/// Broadcast event bus for sync lifecycle events
///
/// Subscribers receive events emitted after subscription; slow subscribers
/// lag and drop the oldest buffered events rather than blocking emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SyncEvent) -> Result<usize, broadcast::error::SendError<SyncEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the case where nobody is listening
    pub fn emit_lossy(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event emitted with no subscribers");
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
