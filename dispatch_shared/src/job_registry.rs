//! Process-wide job identity and lookup.
//!
//! A registry is constructed once and injected wherever jobs are created, so
//! tests get isolated counters. Ids start at 1 and advance by exactly one per
//! call; the table only holds weak references.

use crate::job::{Job, JobId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub struct JobRegistry {
    next_id: Mutex<JobId>,
    jobs: Mutex<HashMap<JobId, Weak<Job>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_job_id(&self) -> JobId {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    pub fn register(&self, job: &Arc<Job>) {
        self.jobs.lock().insert(job.id(), Arc::downgrade(job));
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        let mut jobs = self.jobs.lock();
        match jobs.get(&id).map(Weak::upgrade) {
            Some(Some(job)) => Some(job),
            Some(None) => {
                jobs.remove(&id);
                None
            }
            None => None,
        }
    }

    /// Live jobs ordered by id. Dead entries are pruned.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs = self.jobs.lock();
        jobs.retain(|_, weak| weak.strong_count() > 0);
        let mut live: Vec<Arc<Job>> = jobs.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|job| job.id());
        live
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().values().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
