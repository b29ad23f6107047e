use crate::error::{FetcherError, FetcherResult};
use crate::source::BlockSource;
use crate::types::BlockRecord;
use async_trait::async_trait;
use ethers::types::U256;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Deterministic in-memory chain used by the tests.
pub struct MockBlockSource {
    head: u64,
    delay: Duration,
    transient_failures: Mutex<HashMap<u64, u32>>,
    fatal_blocks: HashSet<u64>,
    head_failures: AtomicU32,
    fetch_calls: AtomicU64,
    gate: watch::Sender<bool>,
}

impl MockBlockSource {
    pub fn new(head: u64) -> Self {
        let (gate, _) = watch::channel(true);
        MockBlockSource {
            head,
            delay: Duration::ZERO,
            transient_failures: Mutex::new(HashMap::new()),
            fatal_blocks: HashSet::new(),
            head_failures: AtomicU32::new(0),
            fetch_calls: AtomicU64::new(0),
            gate,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `fetch_block(number)` fails with a transient error `times` times before succeeding.
    pub fn fail_transiently(self, number: u64, times: u32) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(number, times);
        self
    }

    pub fn fail_fatally(mut self, number: u64) -> Self {
        self.fatal_blocks.insert(number);
        self
    }

    pub fn fail_head(self, times: u32) -> Self {
        self.head_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Block every fetch until `open` is called.
    pub fn closed(self) -> Self {
        self.gate.send_replace(false);
        self
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn record(number: u64) -> BlockRecord {
        BlockRecord {
            number,
            timestamp: 1_600_000_000 + number * 12,
            gas_used: U256::from(number * 1_000),
            base_fee_per_gas: U256::from(7u64),
            transaction_count: (number % 5) as usize,
            tips: U256::from(number * 3),
        }
    }
}

#[async_trait]
impl BlockSource for MockBlockSource {
    async fn chain_head(&self) -> FetcherResult<u64> {
        let remaining = self.head_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.head_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FetcherError::UpstreamTransient(
                "connection refused".to_string(),
            ));
        }
        Ok(self.head)
    }

    async fn fetch_block(&self, number: u64) -> FetcherResult<BlockRecord> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if self.fatal_blocks.contains(&number) {
            return Err(FetcherError::UpstreamFatal(format!(
                "Block {} rejected: unauthorized",
                number
            )));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetcherError::UpstreamTransient(format!(
                        "timeout fetching block {}",
                        number
                    )));
                }
            }
        }
        if number > self.head {
            return Err(FetcherError::UpstreamFatal(format!(
                "Block {} not found",
                number
            )));
        }
        Ok(Self::record(number))
    }
}
