pub mod cache;
#[cfg(test)]
pub mod mock;
pub mod rpc;

use crate::error::FetcherResult;
use crate::types::BlockRecord;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};

pub use cache::CachedBlockSource;
pub use rpc::RpcBlockSource;

/// Upstream chain data the range workers read from.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Latest block number known to the upstream.
    async fn chain_head(&self) -> FetcherResult<u64>;

    async fn fetch_block(&self, number: u64) -> FetcherResult<BlockRecord>;

    /// Fetch `from..=to` with at most `concurrency` requests in flight.
    /// Records come back in ascending block order; the first error aborts the range.
    async fn fetch_range(
        &self,
        from: u64,
        to: u64,
        concurrency: usize,
    ) -> FetcherResult<Vec<BlockRecord>> {
        stream::iter(from..=to)
            .map(|number| self.fetch_block(number))
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }
}
