use crate::error::{FetcherError, FetcherResult};
use crate::source::BlockSource;
use crate::types::BlockRecord;
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{Block, Transaction, U256};
use log::{debug, info};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

// JSON-RPC codes providers use for throttling and temporary overload
const RPC_LIMIT_EXCEEDED: i64 = -32005;
const RPC_TOO_MANY_REQUESTS: i64 = 429;

/// Reads blocks over Ethereum JSON-RPC (`eth_getBlockByNumber` with full transactions).
pub struct RpcBlockSource {
    provider: Provider<Http>,
    limiter: Mutex<Interval>,
}

impl RpcBlockSource {
    pub fn new(rpc_url: &str, requests_per_sec: u32) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        let period =
            (Duration::from_secs(1) / requests_per_sec.max(1)).max(Duration::from_nanos(1));
        let mut limiter = interval(period);
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Upstream RPC:{} rate limit:{}/s", rpc_url, requests_per_sec.max(1));

        Ok(RpcBlockSource {
            provider,
            limiter: Mutex::new(limiter),
        })
    }

    async fn throttle(&self) {
        self.limiter.lock().await.tick().await;
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn chain_head(&self) -> FetcherResult<u64> {
        self.throttle().await;
        let head = self.provider.get_block_number().await.map_err(classify)?;
        Ok(head.as_u64())
    }

    async fn fetch_block(&self, number: u64) -> FetcherResult<BlockRecord> {
        self.throttle().await;
        debug!("eth_getBlockByNumber {}", number);
        let block = self
            .provider
            .get_block_with_txs(number)
            .await
            .map_err(classify)?
            .ok_or_else(|| FetcherError::UpstreamFatal(format!("Block {} not found", number)))?;

        Ok(to_record(number, &block))
    }
}

pub fn to_record(number: u64, block: &Block<Transaction>) -> BlockRecord {
    let base_fee = block.base_fee_per_gas.unwrap_or_default();
    BlockRecord {
        number: block.number.map(|n| n.as_u64()).unwrap_or(number),
        timestamp: block.timestamp.low_u64(),
        gas_used: block.gas_used,
        base_fee_per_gas: base_fee,
        transaction_count: block.transactions.len(),
        tips: total_tips(base_fee, &block.transactions),
    }
}

/// Priority fees paid to the block producer: sum of max(gas_price - base_fee, 0) * gas.
pub fn total_tips(base_fee: U256, txs: &[Transaction]) -> U256 {
    txs.iter().fold(U256::zero(), |acc, tx| {
        let tip = tx.gas_price.unwrap_or_default().saturating_sub(base_fee);
        acc.saturating_add(tip.saturating_mul(tx.gas))
    })
}

fn classify(err: ProviderError) -> FetcherError {
    let message = err.to_string();
    let transient = match &err {
        ProviderError::JsonRpcClientError(inner) => {
            if let Some(resp) = inner.as_error_response() {
                is_transient_rpc_error(resp.code, &resp.message)
            } else if inner.as_serde_error().is_some() {
                // a body that is not JSON-RPC is only worth retrying when a proxy produced it
                is_overload_page(&message)
            } else {
                // transport failures; auth rejections are final
                !is_auth_failure(&message)
            }
        }
        ProviderError::HTTPError(http) => is_transient_status(http.status().map(|s| s.as_u16())),
        _ => false,
    };

    if transient {
        FetcherError::UpstreamTransient(message)
    } else {
        FetcherError::UpstreamFatal(message)
    }
}

pub fn is_transient_rpc_error(code: i64, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    code == RPC_LIMIT_EXCEEDED
        || code == RPC_TOO_MANY_REQUESTS
        || message.contains("rate limit")
        || message.contains("too many requests")
        || message.contains("timeout")
        || message.contains("header not found")
}

fn is_transient_status(status: Option<u16>) -> bool {
    !matches!(status, Some(401) | Some(403))
}

fn has_status_code(message: &str, codes: &[&str]) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| codes.contains(&word))
}

fn is_overload_page(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    has_status_code(&message, &["429", "502", "503", "504"])
        || [
            "too many requests",
            "rate limit",
            "bad gateway",
            "service unavailable",
            "gateway timeout",
        ]
        .iter()
        .any(|marker| message.contains(marker))
}

fn is_auth_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    has_status_code(&message, &["401", "403"])
        || ["unauthorized", "forbidden", "invalid api key", "must be authenticated"]
            .iter()
            .any(|marker| message.contains(marker))
}
