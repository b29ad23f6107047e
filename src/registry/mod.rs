use crate::error::{FetcherError, FetcherResult};
use crate::types::{Job, JobStatus, StatusChange};
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Source of truth for job state.
///
/// The map is only write-locked to insert; each job sits behind its own mutex
/// so transitions of one job are serialized while different jobs move in parallel.
pub struct JobRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, Arc<Mutex<Job>>>,
    // creation order for listing
    order: Vec<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub async fn create(&self, start: u64, end: u64) -> FetcherResult<String> {
        if end < start {
            return Err(FetcherError::InvalidRange { start, end });
        }

        let mut inner = self.inner.write().await;
        let job_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !inner.jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.jobs.insert(
            job_id.clone(),
            Arc::new(Mutex::new(Job::new(job_id.clone(), start, end))),
        );
        inner.order.push(job_id.clone());
        info!("[{}] Job created {}-{}", job_id, start, end);

        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> FetcherResult<Job> {
        let entry = self.entry(job_id).await?;
        let job = entry.lock().await;
        Ok(job.clone())
    }

    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    pub async fn transition(
        &self,
        job_id: &str,
        next: JobStatus,
        error: Option<String>,
    ) -> FetcherResult<Job> {
        let entry = self.entry(job_id).await?;
        let mut job = entry.lock().await;
        let current = job.status;
        if !current.can_transition_to(next) {
            return Err(FetcherError::InvalidTransition {
                job_id: job_id.to_string(),
                from: current,
                to: next,
            });
        }

        let now = Utc::now();
        job.status = next;
        job.updated_at = now;
        job.history.push(StatusChange {
            status: next,
            at: now,
        });
        if next.is_terminal() {
            job.completed_at = Some(now);
        }
        if error.is_some() {
            job.error = error;
        }
        match &job.error {
            Some(reason) if next == JobStatus::Failed => {
                info!("[{}] {} -> {}: {}", job_id, current, next, reason)
            }
            _ => info!("[{}] {} -> {}", job_id, current, next),
        }

        Ok(job.clone())
    }

    /// Progress is only tracked while the job runs.
    pub async fn record_progress(&self, job_id: &str, blocks_fetched: u64) -> FetcherResult<()> {
        let entry = self.entry(job_id).await?;
        let mut job = entry.lock().await;
        if job.status == JobStatus::Running {
            job.blocks_fetched = blocks_fetched;
            job.updated_at = Utc::now();
            debug!(
                "[{}] Progress {}/{}",
                job_id,
                blocks_fetched,
                job.block_count()
            );
        }
        Ok(())
    }

    async fn entry(&self, job_id: &str) -> FetcherResult<Arc<Mutex<Job>>> {
        self.inner
            .read()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| FetcherError::NotFound(job_id.to_string()))
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
