use crate::error::{FetcherError, FetcherResult};
use crate::registry::JobRegistry;
use crate::source::BlockSource;
use crate::storage::{ResultStorage, ResultWriter};
use crate::types::cfg::EngineCfg;
use crate::types::{BlockChunk, JobStatus};
use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Runs one job's block range against the upstream and streams it into the result storage.
pub struct FetchEngine {
    source: Arc<dyn BlockSource>,
    registry: Arc<JobRegistry>,
    result_storage: Arc<ResultStorage>,
    cfg: EngineCfg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { rows: u64 },
    Stopped,
    Failed(String),
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Stopped => JobStatus::Stopped,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

impl FetchEngine {
    pub fn new(
        source: Arc<dyn BlockSource>,
        registry: Arc<JobRegistry>,
        result_storage: Arc<ResultStorage>,
        cfg: EngineCfg,
    ) -> Self {
        info!(
            "Engine batch size:{} concurrency:{} attempts:{}",
            cfg.batch_size, cfg.fetch_concurrency, cfg.retry.max_attempts
        );
        FetchEngine {
            source,
            registry,
            result_storage,
            cfg,
        }
    }

    /// Execute a job the scheduler already moved to Running and record how it ended.
    pub async fn execute_job(
        &self,
        job_id: &str,
        from_block: u64,
        to_block: u64,
        cancel: CancellationToken,
    ) -> JobOutcome {
        info!("[{}] Start job {}-{}", job_id, from_block, to_block);
        let now = Instant::now();
        let outcome = self.run(job_id, from_block, to_block, &cancel).await;
        info!(
            "[{}] End job {:?}. Took:{}mils",
            job_id,
            outcome,
            now.elapsed().as_millis()
        );

        let reason = match &outcome {
            JobOutcome::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        if let Err(err) = self
            .registry
            .transition(job_id, outcome.status(), reason)
            .await
        {
            error!("[{}] Cannot record job end: {}", job_id, err);
        }
        outcome
    }

    async fn run(
        &self,
        job_id: &str,
        from_block: u64,
        to_block: u64,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        if cancel.is_cancelled() {
            return JobOutcome::Stopped;
        }

        // chain head check: the upstream must be reachable and already hold the range
        let head = match self
            .with_retry(job_id, "chain head", cancel, || self.source.chain_head())
            .await
        {
            Ok(Some(head)) => head,
            Ok(None) => return JobOutcome::Stopped,
            Err(err) => return JobOutcome::Failed(err.to_string()),
        };
        if to_block > head {
            return JobOutcome::Failed(format!(
                "Block range end {} is beyond chain head {}",
                to_block, head
            ));
        }

        let writer = match self.result_storage.open_writer(job_id).await {
            Ok(writer) => writer,
            Err(err) => return JobOutcome::Failed(err.to_string()),
        };

        match self
            .fetch_batches(job_id, from_block, to_block, cancel, &writer)
            .await
        {
            Ok(true) => match writer.commit().await {
                Ok(rows) => JobOutcome::Completed { rows },
                Err(err) => JobOutcome::Failed(err.to_string()),
            },
            Ok(false) => {
                abort_writer(job_id, writer).await;
                JobOutcome::Stopped
            }
            Err(err) => {
                // a dead writer explains more than the failed send
                let err = match err {
                    FetcherError::Storage(_) => writer.abort().await.err().unwrap_or(err),
                    other => {
                        abort_writer(job_id, writer).await;
                        other
                    }
                };
                JobOutcome::Failed(err.to_string())
            }
        }
    }

    // Ok(true) when the whole range was written, Ok(false) when stopped at a batch boundary.
    async fn fetch_batches(
        &self,
        job_id: &str,
        from_block: u64,
        to_block: u64,
        cancel: &CancellationToken,
        writer: &ResultWriter,
    ) -> FetcherResult<bool> {
        let batch_size = self.cfg.batch_size.max(1);
        let mut fetched: u64 = 0;
        let mut batch_start = from_block;

        loop {
            if cancel.is_cancelled() {
                info!("[{}] Stop requested at block {}", job_id, batch_start);
                return Ok(false);
            }
            let batch_end = batch_start.saturating_add(batch_size - 1).min(to_block);

            let what = format!("batch {}-{}", batch_start, batch_end);
            let blocks = match self
                .with_retry(job_id, &what, cancel, || {
                    self.source
                        .fetch_range(batch_start, batch_end, self.cfg.fetch_concurrency)
                })
                .await?
            {
                Some(blocks) => blocks,
                None => return Ok(false),
            };

            fetched += blocks.len() as u64;
            writer.write(BlockChunk { blocks }).await?;
            if let Err(err) = self.registry.record_progress(job_id, fetched).await {
                warn!("[{}] Progress not recorded: {}", job_id, err);
            }
            info!("[{}] block:{} fetched:{}", job_id, batch_end, fetched);

            if batch_end >= to_block {
                return Ok(true);
            }
            batch_start = batch_end + 1;
        }
    }

    /// Retry transient failures with exponential backoff. Ok(None) means the job
    /// was stopped while waiting for the next attempt.
    async fn with_retry<T, F, Fut>(
        &self,
        job_id: &str,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> FetcherResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetcherResult<T>>,
    {
        let policy = self.cfg.retry;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "[{}] {} failed (attempt {}/{}): {}. Retry in {}mils",
                        job_id,
                        what,
                        attempt,
                        policy.max_attempts,
                        err,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => {
                    error!("[{}] {} failed after {} attempt(s): {}", job_id, what, attempt, err);
                    return Err(err);
                }
            }
        }
    }
}

async fn abort_writer(job_id: &str, writer: ResultWriter) {
    if let Err(err) = writer.abort().await {
        warn!("[{}] Discarding partial result failed: {}", job_id, err);
    }
}

#[cfg(test)]
mod test {
    use crate::engine::{FetchEngine, JobOutcome};
    use crate::registry::JobRegistry;
    use crate::source::mock::MockBlockSource;
    use crate::storage::ResultStorage;
    use crate::types::cfg::{EngineCfg, RetryPolicy};
    use crate::types::JobStatus;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: TempDir,
        source: Arc<MockBlockSource>,
        registry: Arc<JobRegistry>,
        storage: Arc<ResultStorage>,
        engine: FetchEngine,
    }

    fn fixture(source: MockBlockSource, batch_size: u64) -> Fixture {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        fixture_with_retry(source, batch_size, retry)
    }

    fn fixture_with_retry(source: MockBlockSource, batch_size: u64, retry: RetryPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(source);
        let registry = Arc::new(JobRegistry::new());
        let storage = Arc::new(ResultStorage::new(dir.path().to_path_buf()).unwrap());
        let cfg = EngineCfg {
            batch_size,
            fetch_concurrency: 4,
            retry,
        };
        let engine = FetchEngine::new(source.clone(), registry.clone(), storage.clone(), cfg);
        Fixture {
            _dir: dir,
            source,
            registry,
            storage,
            engine,
        }
    }

    async fn running_job(registry: &JobRegistry, start: u64, end: u64) -> String {
        let id = registry.create(start, end).await.unwrap();
        registry.transition(&id, JobStatus::Running, None).await.unwrap();
        id
    }

    async fn csv_blocks(storage: &ResultStorage, job_id: &str) -> Vec<u64> {
        let mut csv = String::new();
        storage
            .get(job_id)
            .await
            .unwrap()
            .read_to_string(&mut csv)
            .await
            .unwrap();
        csv.lines()
            .skip(1)
            .map(|l| l.split(',').next().unwrap().parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn completes_range_in_order() {
        let f = fixture(MockBlockSource::new(1_000), 2);
        let id = running_job(&f.registry, 100, 104).await;

        let outcome = f
            .engine
            .execute_job(&id, 100, 104, CancellationToken::new())
            .await;

        assert_eq!(outcome, JobOutcome::Completed { rows: 5 });
        assert_eq!(csv_blocks(&f.storage, &id).await, vec![100, 101, 102, 103, 104]);
        let job = f.registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.blocks_fetched, 5);
    }

    #[tokio::test]
    async fn large_range_has_no_gaps_or_duplicates() {
        let f = fixture(MockBlockSource::new(10_000), 100);
        let id = running_job(&f.registry, 1_234, 1_733).await;
        let outcome = f
            .engine
            .execute_job(&id, 1_234, 1_733, CancellationToken::new())
            .await;
        assert_eq!(outcome, JobOutcome::Completed { rows: 500 });
        let blocks = csv_blocks(&f.storage, &id).await;
        assert_eq!(blocks, (1_234..=1_733).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let source = MockBlockSource::new(1_000)
            .fail_transiently(101, 2)
            .fail_head(1);
        let f = fixture(source, 10);
        let id = running_job(&f.registry, 100, 110).await;

        let outcome = f
            .engine
            .execute_job(&id, 100, 110, CancellationToken::new())
            .await;

        assert_eq!(outcome, JobOutcome::Completed { rows: 11 });
        assert_eq!(csv_blocks(&f.storage, &id).await.len(), 11);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let f = fixture(MockBlockSource::new(1_000).fail_transiently(105, 3), 10);
        let id = running_job(&f.registry, 100, 110).await;

        let outcome = f
            .engine
            .execute_job(&id, 100, 110, CancellationToken::new())
            .await;

        let JobOutcome::Failed(reason) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("timeout fetching block 105"));
        let job = f.registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(reason.as_str()));
        assert!(!f.storage.contains(&id).await);
    }

    #[tokio::test]
    async fn fatal_errors_fail_without_retry() {
        let f = fixture(MockBlockSource::new(1_000).fail_fatally(100), 1);
        let id = running_job(&f.registry, 100, 101).await;

        let outcome = f
            .engine
            .execute_job(&id, 100, 101, CancellationToken::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Failed(ref r) if r.contains("unauthorized")));
        assert_eq!(f.source.fetch_calls(), 1);
        assert!(!f.storage.contains(&id).await);
    }

    #[tokio::test]
    async fn unreachable_upstream_fails_at_dispatch() {
        let f = fixture(MockBlockSource::new(1_000).fail_head(3), 10);
        let id = running_job(&f.registry, 1, 2).await;

        let outcome = f
            .engine
            .execute_job(&id, 1, 2, CancellationToken::new())
            .await;

        assert!(matches!(outcome, JobOutcome::Failed(ref r) if r.contains("connection refused")));
        assert_eq!(f.source.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn range_beyond_head_fails() {
        let f = fixture(MockBlockSource::new(50), 10);
        let id = running_job(&f.registry, 40, 60).await;
        let outcome = f
            .engine
            .execute_job(&id, 40, 60, CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            JobOutcome::Failed("Block range end 60 is beyond chain head 50".to_string())
        );
    }

    #[tokio::test]
    async fn stop_takes_effect_at_batch_boundary() {
        let source = MockBlockSource::new(1_000).with_delay(Duration::from_millis(20));
        let f = Arc::new(fixture(source, 2));
        let id = running_job(&f.registry, 0, 99).await;
        let cancel = CancellationToken::new();

        let task = {
            let f = f.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.engine.execute_job(&id, 0, 99, cancel).await })
        };
        while f.source.fetch_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        let outcome = task.await.unwrap();

        assert_eq!(outcome, JobOutcome::Stopped);
        // the in-flight batch finished, nothing after it started
        let calls = f.source.fetch_calls();
        assert!(calls >= 2 && calls % 2 == 0 && calls < 100, "calls {calls}");
        let job = f.registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(!f.storage.contains(&id).await);
    }

    #[tokio::test]
    async fn stop_interrupts_retry_backoff() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
        };
        let source = MockBlockSource::new(1_000).fail_transiently(1, 5);
        let f = Arc::new(fixture_with_retry(source, 10, retry));
        let id = running_job(&f.registry, 1, 5).await;
        let cancel = CancellationToken::new();

        let task = {
            let f = f.clone();
            let id = id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.engine.execute_job(&id, 1, 5, cancel).await })
        };
        while f.source.fetch_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stop waited for the backoff to elapse")
            .unwrap();

        assert_eq!(outcome, JobOutcome::Stopped);
        let job = f.registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(job.blocks_fetched, 0);
        assert!(!f.storage.contains(&id).await);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let f = fixture(MockBlockSource::new(1_000), 10);
        let id = running_job(&f.registry, 1, 5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            f.engine.execute_job(&id, 1, 5, cancel).await,
            JobOutcome::Stopped
        );
        assert_eq!(f.source.fetch_calls(), 0);
    }
}
