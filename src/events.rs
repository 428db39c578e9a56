//! Lifecycle notifications published by the core.
//!
//! The core only writes events; it never subscribes to control events.
//! Consumers (self-healing orchestrators, dashboards) attach to a
//! [`BroadcastSink`], and tests substitute a [`RecordingSink`].

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    SandboxStarted {
        sandbox_id: String,
        container_id: String,
        branch: String,
        resumed: bool,
    },
    SandboxStopped {
        sandbox_id: String,
    },
    SandboxDestroyed {
        sandbox_id: String,
    },
    SandboxError {
        sandbox_id: String,
        error: String,
    },
    SessionStarted {
        session_id: String,
        purpose: String,
    },
    SessionCompleted {
        session_id: String,
        status: String,
        commit: Option<String>,
    },
    ExecutionStarted {
        task_id: String,
        objective: String,
    },
    IterationCompleted {
        task_id: String,
        iteration: u32,
        pass_rate: f64,
        type_check_passed: bool,
    },
    ExecutionEnded {
        task_id: String,
        status: String,
        commit: Option<String>,
    },
    PromotionRequested {
        task_id: String,
        commit: String,
    },
    ArtifactPrepared {
        artifact_id: String,
        files: usize,
    },
    ArtifactReviewed {
        artifact_id: String,
        approved: bool,
        reviewer: String,
    },
    Executed {
        artifact_id: String,
        success: bool,
        production_commit: Option<String>,
    },
    RolledBack {
        artifact_id: String,
        restored: usize,
        expected: usize,
    },
}

impl CoreEvent {
    /// The snake_case event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::SandboxStarted { .. } => "sandbox_started",
            CoreEvent::SandboxStopped { .. } => "sandbox_stopped",
            CoreEvent::SandboxDestroyed { .. } => "sandbox_destroyed",
            CoreEvent::SandboxError { .. } => "sandbox_error",
            CoreEvent::SessionStarted { .. } => "session_started",
            CoreEvent::SessionCompleted { .. } => "session_completed",
            CoreEvent::ExecutionStarted { .. } => "execution_started",
            CoreEvent::IterationCompleted { .. } => "iteration_completed",
            CoreEvent::ExecutionEnded { .. } => "execution_ended",
            CoreEvent::PromotionRequested { .. } => "promotion_requested",
            CoreEvent::ArtifactPrepared { .. } => "artifact_prepared",
            CoreEvent::ArtifactReviewed { .. } => "artifact_reviewed",
            CoreEvent::Executed { .. } => "executed",
            CoreEvent::RolledBack { .. } => "rolled_back",
        }
    }
}

/// Publish-and-forget output channel.
pub trait EventSink: Send + Sync {
    /// Publishes an event. Must not block or fail.
    fn publish(&self, event: CoreEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: CoreEvent) {}
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastSink {
    /// Creates a sink buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: CoreEvent) {
        tracing::debug!(event = event.name(), "publishing event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Returns the names of all recorded events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(CoreEvent::name).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: CoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
