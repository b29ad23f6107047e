use crate::types::JobStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Invalid block range: end {end} is lower than start {start}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Result of job {job_id} is not ready (status: {status})")]
    ResultNotReady { job_id: String, status: JobStatus },
    #[error("Upstream transient error: {0}")]
    UpstreamTransient(String),
    #[error("Upstream fatal error: {0}")]
    UpstreamFatal(String),
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("Block cache error: {0}")]
    Cache(#[from] rusqlite::Error),
}

impl FetcherError {
    /// Errors worth another attempt against the upstream source.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetcherError::UpstreamTransient(_))
    }
}

pub type FetcherResult<T> = Result<T, FetcherError>;
