//! Four-bucket job lifecycle store.
//!
//! Each job is one JSON file named by id under `<root>/<bucket>/`. A job's
//! state is the directory its file lives in; transitions are a single
//! `rename`, so a record is never observable in two buckets at once.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::StoreError;
use crate::events::{EventBus, EventKind};

use super::models::{Bucket, Job, sort_for_dispatch};

#[derive(Clone)]
pub struct JobStore {
    root: PathBuf,
    bus: EventBus,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>, bus: EventBus) -> Self {
        Self {
            root: root.into(),
            bus,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.as_str())
    }

    fn record_path(&self, bucket: Bucket, id: &str) -> PathBuf {
        self.bucket_dir(bucket).join(format!("{}.json", id))
    }

    /// Create the four bucket directories if they are missing.
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for bucket in Bucket::ALL {
            let dir = self.bucket_dir(bucket);
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        }
        Ok(())
    }

    /// Write `job` into `pending`. An existing record with the same id is
    /// overwritten, wherever it currently lives.
    pub fn create(&self, job: &Job) -> Result<(), StoreError> {
        validate_id(&job.id)?;
        self.ensure_layout()?;

        let body = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Encode {
            id: job.id.clone(),
            source,
        })?;
        let target = self.record_path(Bucket::Pending, &job.id);
        let tmp = self
            .bucket_dir(Bucket::Pending)
            .join(format!(".{}.json.tmp", job.id));
        fs::write(&tmp, body).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &target).map_err(|source| StoreError::Io {
            path: target.clone(),
            source,
        })?;

        for bucket in Bucket::ALL.into_iter().filter(|b| *b != Bucket::Pending) {
            let stale = self.record_path(bucket, &job.id);
            match fs::remove_file(&stale) {
                Ok(()) => {
                    tracing::warn!(job_id = %job.id, from = %bucket, "overwrote existing job record")
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path: stale, source }),
            }
        }

        self.bus.publish(EventKind::JobCreated { job: job.clone() });
        Ok(())
    }

    /// Move a record between buckets.
    ///
    /// Returns `Ok(false)` when the record is not in `from`; the bucket
    /// directories may be edited externally, so that case is logged rather
    /// than treated as an error.
    pub fn transition(&self, id: &str, from: Bucket, to: Bucket) -> Result<bool, StoreError> {
        validate_id(id)?;
        let src = self.record_path(from, id);
        if !src.exists() {
            tracing::warn!(job_id = %id, %from, %to, "transition skipped: job not in source bucket");
            return Ok(false);
        }

        let to_dir = self.bucket_dir(to);
        fs::create_dir_all(&to_dir).map_err(|source| StoreError::Io {
            path: to_dir,
            source,
        })?;
        let dst = self.record_path(to, id);
        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(job_id = %id, %from, %to, "transition skipped: job moved concurrently");
                return Ok(false);
            }
            Err(source) => return Err(StoreError::Io { path: src, source }),
        }

        tracing::debug!(job_id = %id, %from, %to, "job transitioned");
        self.bus.publish(EventKind::JobStatus {
            job_id: id.to_string(),
            status: to,
        });
        Ok(true)
    }

    /// All records in a bucket, in dispatch order. Unreadable files are skipped.
    pub fn list(&self, bucket: Bucket) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for path in self.record_files(bucket)? {
            match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<Job>(&text) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unparseable job file")
                    }
                },
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        sort_for_dispatch(&mut jobs);
        Ok(jobs)
    }

    pub fn count(&self, bucket: Bucket) -> Result<usize, StoreError> {
        Ok(self.record_files(bucket)?.len())
    }

    /// Which bucket currently holds `id`, if any.
    pub fn locate(&self, id: &str) -> Option<Bucket> {
        Bucket::ALL
            .into_iter()
            .find(|bucket| self.record_path(*bucket, id).exists())
    }

    /// Move jobs left `in-progress` by an interrupted run to `failed`.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, StoreError> {
        let mut recovered = Vec::new();
        for job in self.list(Bucket::InProgress)? {
            if self.transition(&job.id, Bucket::InProgress, Bucket::Failed)? {
                recovered.push(job.id);
            }
        }
        Ok(recovered)
    }

    fn record_files(&self, bucket: Bucket) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.bucket_dir(bucket);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
            if visible && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::EmptyId);
    }
    if id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}
