use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::StoreError;
use crate::events::EventBus;
use crate::jobs::{Bucket, Job, JobStore};

/// One value per bucket, keyed by bucket name on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerBucket<T> {
    pub pending: T,
    #[serde(rename = "in-progress")]
    pub in_progress: T,
    pub completed: T,
    pub failed: T,
}

impl<T> PerBucket<T> {
    pub fn get(&self, bucket: Bucket) -> &T {
        match bucket {
            Bucket::Pending => &self.pending,
            Bucket::InProgress => &self.in_progress,
            Bucket::Completed => &self.completed,
            Bucket::Failed => &self.failed,
        }
    }

    fn get_mut(&mut self, bucket: Bucket) -> &mut T {
        match bucket {
            Bucket::Pending => &mut self.pending,
            Bucket::InProgress => &mut self.in_progress,
            Bucket::Completed => &mut self.completed,
            Bucket::Failed => &mut self.failed,
        }
    }
}

/// Read model for observers, rebuilt from the job buckets on demand.
///
/// Built only from the store and the bus status, so two snapshots taken with
/// no writes in between are equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub iteration: u32,
    pub counts: PerBucket<usize>,
    pub jobs: PerBucket<Vec<Job>>,
    pub last_update: Option<DateTime<Utc>>,
    pub connected: bool,
}

impl DashboardState {
    pub fn snapshot(store: &JobStore, bus: &EventBus) -> Result<Self, StoreError> {
        let status = bus.status();
        let mut state = DashboardState {
            iteration: status.iteration,
            last_update: status.last_event_at,
            connected: status.connected,
            ..Default::default()
        };
        for bucket in Bucket::ALL {
            let jobs = store.list(bucket)?;
            *state.counts.get_mut(bucket) = jobs.len();
            *state.jobs.get_mut(bucket) = jobs;
        }
        Ok(state)
    }
}
