use crate::engine::{FetchEngine, JobOutcome};
use crate::error::{FetcherError, FetcherResult};
use crate::registry::JobRegistry;
use crate::types::{Job, JobStatus};
use log::{error, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::spawn;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Bounded worker pool with a FIFO wait queue.
///
/// Workers run as their own tasks and report back through a channel; a single
/// release loop frees their slot and dispatches the next queued job.
pub struct Scheduler {
    capacity: usize,
    registry: Arc<JobRegistry>,
    engine: Arc<FetchEngine>,
    state: Mutex<SchedulerState>,
    finished: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct SchedulerState {
    running: HashMap<String, CancellationToken>,
    queue: VecDeque<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Removed from the wait queue, never ran.
    Dequeued,
    /// Running worker signalled; it stops at its next batch boundary.
    Cancelling,
}

impl Scheduler {
    pub fn new(capacity: usize, registry: Arc<JobRegistry>, engine: Arc<FetchEngine>) -> Arc<Self> {
        let capacity = capacity.max(1);
        info!("Scheduler slots:{}", capacity);
        let (finished, rcv) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Scheduler {
            capacity,
            registry,
            engine,
            state: Mutex::new(SchedulerState::default()),
            finished,
        });
        spawn(release_loop(Arc::downgrade(&scheduler), rcv));
        scheduler
    }

    /// Register a job and queue it; it starts right away when a slot is free.
    pub async fn submit(&self, start: u64, end: u64) -> FetcherResult<Job> {
        let mut state = self.state.lock().await;
        let job_id = self.registry.create(start, end).await?;
        state.queue.push_back(job_id.clone());
        self.dispatch(&mut state).await;
        drop(state);

        self.registry.get(&job_id).await
    }

    pub async fn stop(&self, job_id: &str) -> FetcherResult<StopOutcome> {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.queue.iter().position(|id| id == job_id) {
            state.queue.remove(pos);
            self.registry
                .transition(job_id, JobStatus::Stopped, None)
                .await?;
            info!("[{}] Removed from queue", job_id);
            return Ok(StopOutcome::Dequeued);
        }

        let job = self.registry.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(FetcherError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Stopped,
            });
        }
        match state.running.get(job_id) {
            Some(cancel) => {
                info!("[{}] Stop requested", job_id);
                cancel.cancel();
                Ok(StopOutcome::Cancelling)
            }
            None => Err(FetcherError::NotFound(job_id.to_string())),
        }
    }

    /// Cancel every running job and stop everything still queued.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        info!(
            "Scheduler shutdown. Running:{} queued:{}",
            state.running.len(),
            state.queue.len()
        );
        while let Some(job_id) = state.queue.pop_front() {
            if let Err(err) = self
                .registry
                .transition(&job_id, JobStatus::Stopped, None)
                .await
            {
                error!("[{}] {}", job_id, err);
            }
        }
        for cancel in state.running.values() {
            cancel.cancel();
        }
    }

    #[cfg(test)]
    pub async fn running_jobs(&self) -> Vec<String> {
        self.state.lock().await.running.keys().cloned().collect()
    }

    #[cfg(test)]
    pub async fn queued_jobs(&self) -> Vec<String> {
        self.state.lock().await.queue.iter().cloned().collect()
    }

    async fn release(&self, job_id: &str) {
        let mut state = self.state.lock().await;
        state.running.remove(job_id);
        self.dispatch(&mut state).await;
    }

    // Start queued jobs while slots are free. Never waits on a worker.
    async fn dispatch(&self, state: &mut SchedulerState) {
        while state.running.len() < self.capacity {
            let Some(job_id) = state.queue.pop_front() else {
                break;
            };
            let job = match self
                .registry
                .transition(&job_id, JobStatus::Running, None)
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    error!("[{}] Not dispatched: {}", job_id, err);
                    continue;
                }
            };

            let cancel = CancellationToken::new();
            state.running.insert(job_id.clone(), cancel.clone());
            let engine = self.engine.clone();
            let finished = self.finished.clone();
            spawn(async move {
                let outcome = engine.execute_job(&job.id, job.start, job.end, cancel).await;
                if let JobOutcome::Failed(reason) = &outcome {
                    error!("[{}] Job failed: {}", job.id, reason);
                }
                let _ = finished.send(job.id);
            });
        }
    }
}

async fn release_loop(scheduler: Weak<Scheduler>, mut rcv: mpsc::UnboundedReceiver<String>) {
    while let Some(job_id) = rcv.recv().await {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        scheduler.release(&job_id).await;
    }
}
