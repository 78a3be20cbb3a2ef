//! Table of live encoder jobs keyed by output target and scheme.

use crate::domain::jobs::{JobKind, TranscodeJob};
use crate::domain::segments::OutputTarget;
use crate::error::ConflictError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

type JobKey = (OutputTarget, JobKind);

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobKey, Arc<TranscodeJob>>,
    generations: HashMap<JobKey, u64>,
}

/// Constructed once at server start and shared by reference.
#[derive(Debug, Default)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, target: &OutputTarget, kind: JobKind) -> Option<Arc<TranscodeJob>> {
        self.inner
            .lock()
            .jobs
            .get(&(target.clone(), kind))
            .cloned()
    }

    /// Generation number for the next job started on `target`.
    pub fn next_generation(&self, target: &OutputTarget, kind: JobKind) -> u64 {
        let mut inner = self.inner.lock();
        let generation = inner.generations.entry((target.clone(), kind)).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Fails if a job that has not exited is already registered for the same
    /// key. Callers hold the start-exclusion lock.
    pub fn register(&self, job: Arc<TranscodeJob>) -> Result<(), ConflictError> {
        let key = (job.target.clone(), job.kind);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.jobs.get(&key) {
            if !existing.has_exited() {
                return Err(ConflictError {
                    target: job.target.clone(),
                    kind: job.kind,
                });
            }
        }
        debug!(manifest = %job.target, generation = job.generation, "Registered transcode job");
        inner.jobs.insert(key, job);
        Ok(())
    }

    /// Removes `job` if it is still the registered entry for its key.
    pub fn remove(&self, job: &TranscodeJob) -> bool {
        let key = (job.target.clone(), job.kind);
        let mut inner = self.inner.lock();
        match inner.jobs.get(&key) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), job) => {
                inner.jobs.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Kills and removes every job matching `predicate` whose target is not
    /// `exclude`. The table is only locked while collecting candidates.
    pub async fn terminate_matching<P>(&self, predicate: P, exclude: Option<&OutputTarget>) -> usize
    where
        P: Fn(&TranscodeJob) -> bool + Send,
    {
        let candidates: Vec<Arc<TranscodeJob>> = {
            let inner = self.inner.lock();
            inner
                .jobs
                .values()
                .filter(|job| exclude.map_or(true, |excluded| &job.target != excluded))
                .filter(|job| predicate(job))
                .cloned()
                .collect()
        };

        futures::future::join_all(candidates.iter().map(|job| {
            info!(
                manifest = %job.target,
                generation = job.generation,
                pid = ?job.pid(),
                "Terminating transcode job"
            );
            job.kill()
        }))
        .await;

        for job in &candidates {
            self.remove(job);
        }
        candidates.len()
    }

    pub async fn terminate_all(&self) -> usize {
        self.terminate_matching(|_| true, None).await
    }

    /// Raises `job`'s delivered position, never lowering it.
    pub fn advance_watermark(&self, job: &TranscodeJob, ticks: u64) -> u64 {
        job.advance_watermark(ticks)
    }

    /// Drops jobs whose process has exited and returns them.
    pub fn prune_exited(&self) -> Vec<Arc<TranscodeJob>> {
        let mut inner = self.inner.lock();
        let exited: Vec<JobKey> = inner
            .jobs
            .iter()
            .filter(|(_, job)| job.has_exited())
            .map(|(key, _)| key.clone())
            .collect();
        exited
            .into_iter()
            .filter_map(|key| inner.jobs.remove(&key))
            .inspect(|job| debug!(manifest = %job.target, "Pruned exited transcode job"))
            .collect()
    }

    pub fn active_jobs(&self) -> Vec<Arc<TranscodeJob>> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
