//! Typed event bus shared by the coordinator stages and the dashboard.
//!
//! The bus is constructed once by the CLI command and cloned into every
//! component that emits or observes events. It closes when the last clone
//! is dropped, which ends every dashboard subscription.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::controller::report::IterationResult;
use crate::dashboard::state::DashboardState;
use crate::jobs::{Bucket, Job};

/// Default channel capacity; slow observers that fall further behind skip ahead.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum EventKind {
    #[serde(rename = "iteration:start")]
    IterationStart { iteration: u32 },
    #[serde(rename = "iteration:complete")]
    IterationComplete(IterationResult),
    #[serde(rename = "job:created")]
    JobCreated { job: Job },
    #[serde(rename = "job:status")]
    JobStatus { job_id: String, status: Bucket },
    #[serde(rename = "worker:spawned")]
    WorkerSpawned { job_id: String, worker_name: String },
    #[serde(rename = "merge:start")]
    MergeStart { branches: Vec<String> },
    #[serde(rename = "merge:complete")]
    MergeComplete {
        success: bool,
        success_count: usize,
        fail_count: usize,
    },
    /// Full snapshot sent once when an observer connects.
    #[serde(rename = "initial")]
    Initial(DashboardState),
    /// Recomputed snapshot pushed after a relevant change.
    #[serde(rename = "state")]
    State(DashboardState),
}

impl EventKind {
    /// Whether observers should recompute the dashboard snapshot after this event.
    pub fn affects_state(&self) -> bool {
        matches!(
            self,
            EventKind::IterationStart { .. }
                | EventKind::IterationComplete(_)
                | EventKind::JobCreated { .. }
                | EventKind::JobStatus { .. }
                | EventKind::MergeComplete { .. }
        )
    }
}

/// `{type, timestamp, data}` envelope as delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Coordinator-side facts the dashboard cannot read from the job store.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BusStatus {
    pub iteration: u32,
    pub last_event_at: Option<DateTime<Utc>>,
    /// True while a running coordinator owns this bus.
    pub connected: bool,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    status: Arc<RwLock<BusStatus>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            status: Arc::new(RwLock::new(BusStatus::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Stamp and deliver an event. Having no observers is not an error.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event::now(kind);
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            status.last_event_at = Some(event.timestamp);
            if let EventKind::IterationStart { iteration } = &event.kind {
                status.iteration = *iteration;
            }
        }
        tracing::trace!(event = ?event.kind, "publish");
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn status(&self) -> BusStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, connected: bool) {
        self.status.write().unwrap_or_else(|e| e.into_inner()).connected = connected;
    }

    /// Seed the iteration counter when resuming a previous run.
    pub fn set_iteration(&self, iteration: u32) {
        self.status.write().unwrap_or_else(|e| e.into_inner()).iteration = iteration;
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
