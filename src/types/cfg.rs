use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Ethereum Fetcher", long_about = None)]
pub struct Cli {
    /// Base URL of the server
    #[clap(long, env = "ETH_FETCHER_SERVER", global = true, default_value = "http://localhost:8080")]
    pub server: String,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Submit a new job
    Request { start: u64, end: u64 },
    /// Check job status
    Status { job_id: String },
    /// Stop a running job
    Stop { job_id: String },
    /// Download job CSV
    Download { job_id: String, output: PathBuf },
    /// List all job IDs
    List,
    /// Run the job server
    Serve(AppCfg),
}

#[derive(Debug, Clone, clap::Args)]
pub struct AppCfg {
    #[clap(long, env, default_value_t = 8080)]
    pub http_port: u16,
    #[clap(long, env, default_value = "0.0.0.0")]
    pub http_address: String,
    /// Ethereum JSON-RPC endpoint
    #[clap(long, env)]
    pub rpc_url: String,
    /// Requests per second sent to the RPC endpoint
    #[clap(
        long,
        env,
        default_value_t = 25,
        value_parser = clap::value_parser!(u32).range(1..=1_000_000)
    )]
    pub rpc_rate_limit: u32,
    #[clap(long, env, default_value = "./results")]
    pub result_path: PathBuf,
    /// SQLite file caching fetched blocks across jobs and restarts
    #[clap(long, env, default_value = "./block_cache.db")]
    pub cache_path: PathBuf,
    /// Jobs running at the same time
    #[clap(long, env, default_value_t = 4)]
    pub max_workers: usize,
    #[clap(long, env, default_value_t = 100)]
    pub batch_size: u64,
    /// Blocks requested concurrently inside one batch
    #[clap(long, env, default_value_t = 10)]
    pub fetch_concurrency: usize,
    /// Attempts per batch (and per chain head check) before a job fails
    #[clap(long, env, default_value_t = 3)]
    pub max_retries: u32,
    #[clap(long, env, default_value_t = 500)]
    pub retry_base_delay_ms: u64,
}

impl AppCfg {
    pub fn engine_cfg(&self) -> EngineCfg {
        EngineCfg {
            batch_size: self.batch_size.max(1),
            fetch_concurrency: self.fetch_concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_retries.max(1),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(attempt - 1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineCfg {
    pub batch_size: u64,
    pub fetch_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineCfg {
    fn default() -> Self {
        EngineCfg {
            batch_size: 100,
            fetch_concurrency: 10,
            retry: RetryPolicy::default(),
        }
    }
}
