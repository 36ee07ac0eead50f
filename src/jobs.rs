//! In-memory background job tracking
//!
//! One mutex-guarded map. Jobs live only in this process: a restart loses
//! them by design. Completed jobs expire an hour after completion; expiry is
//! applied lazily on lookup.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{IngestReport, IngestStatus, Job};

/// Completed/failed jobs expire after one hour
pub const JOB_TTL: Duration = Duration::from_secs(3600);

#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job in `processing` state and return its id
    pub fn create(&self, filename: &str, collection: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            status: IngestStatus::Processing,
            filename: filename.to_string(),
            collection: collection.to_string(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        self.jobs.lock().insert(id.clone(), job);
        id
    }

    /// Record a job's terminal state
    pub fn complete(&self, job_id: &str, status: IngestStatus, result: Option<IngestReport>, error: Option<String>) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = status;
            job.result = result;
            job.error = error;
            job.completed_at = Some(Utc::now());
        }
    }

    /// Get a copy of the job record. Expired jobs read as absent.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        Self::cleanup_expired(&mut jobs, Utc::now());
        jobs.get(job_id).cloned()
    }

    /// Number of live jobs (after lazy cleanup)
    pub fn len(&self) -> usize {
        let mut jobs = self.jobs.lock();
        Self::cleanup_expired(&mut jobs, Utc::now());
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cleanup_expired(jobs: &mut HashMap<String, Job>, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(JOB_TTL).expect("ttl fits");
        jobs.retain(|_, job| {
            if job.status == IngestStatus::Processing {
                return true;
            }
            let completed = job.completed_at.unwrap_or(job.created_at);
            now - completed <= ttl
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let store = JobStore::new();
        let id = store.create("plan.pdf", "kb");
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, IngestStatus::Processing);
        assert!(job.completed_at.is_none());

        store.complete(&id, IngestStatus::Success, None, None);
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, IngestStatus::Success);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_expiry_is_lazy() {
        let store = JobStore::new();
        let id = store.create("plan.pdf", "kb");
        store.complete(&id, IngestStatus::Error, None, Some("boom".into()));

        // Backdate completion past the TTL
        {
            let mut jobs = store.jobs.lock();
            let job = jobs.get_mut(&id).unwrap();
            job.completed_at = Some(Utc::now() - chrono::Duration::seconds(3700));
        }
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_processing_jobs_never_expire() {
        let store = JobStore::new();
        let id = store.create("plan.pdf", "kb");
        {
            let mut jobs = store.jobs.lock();
            jobs.get_mut(&id).unwrap().created_at = Utc::now() - chrono::Duration::hours(5);
        }
        assert!(store.get(&id).is_some());
    }
}
