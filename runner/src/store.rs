use crate::job::{Job, JobId};
use parking_lot::FairMutex;
use std::{collections::BTreeMap, error::Error};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job {0} does not exist")]
    NotFound(JobId),
    #[error("Job store failure")]
    Backend(#[source] Box<dyn Error + Send + Sync>),
}

/// Persistent collection of jobs
///
/// `modify` is the only way to update a stored job. It runs the closure on the freshest record
/// under the store's own synchronization, so concurrent passes never overwrite each other.
pub trait JobStore: Send + Sync {
    /// store a new job and assign its id
    fn insert(&self, job: Job) -> Result<JobId, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// apply `update` to job `id`, false if there is no such job
    fn modify(&self, id: JobId, update: &mut dyn FnMut(&mut Job)) -> Result<bool, StoreError>;

    /// all jobs ordered by id
    fn list(&self) -> Result<Vec<Job>, StoreError>;

    fn remove(&self, id: JobId) -> Result<Option<Job>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    last_id: u64,
    jobs: BTreeMap<JobId, Job>,
}

/// Job store kept in memory, for tests and single-process use
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: FairMutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn insert(&self, mut job: Job) -> Result<JobId, StoreError> {
        let mut inner = self.inner.lock();
        inner.last_id += 1;

        let id = JobId(inner.last_id);
        job.id = id;
        inner.jobs.insert(id, job);

        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    fn modify(&self, id: JobId, update: &mut dyn FnMut(&mut Job)) -> Result<bool, StoreError> {
        Ok(match self.inner.lock().jobs.get_mut(&id) {
            Some(job) => {
                update(job);
                true
            }
            None => false,
        })
    }

    fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.inner.lock().jobs.values().cloned().collect())
    }

    fn remove(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.lock().jobs.remove(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Backend, JobRequest, JobStatus};

    fn job(name: &str) -> Job {
        Job::new(JobRequest {
            name: name.into(),
            backend: Backend::Local,
            script: "train.py".into(),
            config: serde_yaml::Value::Null,
        })
    }

    #[test]
    fn ids_are_sequential_and_never_reused() {
        let store = MemoryStore::new();

        let a = store.insert(job("a")).unwrap();
        let b = store.insert(job("b")).unwrap();
        assert_eq!((a, b), (JobId(1), JobId(2)));

        store.remove(b).unwrap();
        assert_eq!(store.insert(job("c")).unwrap(), JobId(3));
        assert_eq!(
            store
                .list()
                .unwrap()
                .iter()
                .map(|job| job.name.as_str())
                .collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn modify_updates_in_place() {
        let store = MemoryStore::new();
        let id = store.insert(job("a")).unwrap();

        assert!(store
            .modify(id, &mut |job| job.status = JobStatus::Running)
            .unwrap());
        assert!(!store.modify(JobId(99), &mut |_| {}).unwrap());

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.status, JobStatus::Running);
    }
}
