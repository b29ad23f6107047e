use crate::error::{FetcherError, FetcherResult};
use crate::source::BlockSource;
use crate::types::BlockRecord;
use crate::util::display_path;
use async_trait::async_trait;
use ethers::types::U256;
use log::{debug, info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Serves blocks from a SQLite table and asks `inner` only for blocks it has not seen.
///
/// Finalized blocks never change, so entries are kept forever and survive restarts.
/// Cache failures are logged and the block is fetched upstream instead.
pub struct CachedBlockSource<S> {
    inner: S,
    db: Arc<Mutex<Connection>>,
}

impl<S: BlockSource> CachedBlockSource<S> {
    pub fn open(inner: S, db_path: &Path) -> FetcherResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!("Block cache:{}", display_path(db_path));
        Self::with_connection(inner, conn)
    }

    #[cfg(test)]
    pub fn in_memory(inner: S) -> FetcherResult<Self> {
        Self::with_connection(inner, Connection::open_in_memory()?)
    }

    fn with_connection(inner: S, conn: Connection) -> FetcherResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS block_cache (
                 block_num INTEGER PRIMARY KEY,
                 timestamp INTEGER NOT NULL,
                 gas_used TEXT NOT NULL,
                 base_fee_per_gas TEXT NOT NULL,
                 transaction_count INTEGER NOT NULL,
                 total_tips TEXT NOT NULL
             );",
        )?;
        Ok(CachedBlockSource {
            inner,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn lookup(&self, number: u64) -> FetcherResult<Option<BlockRecord>> {
        let db = self.db.clone();
        blocking(move || {
            let conn = db.lock().map_err(|_| poisoned())?;
            let result = conn.query_row(
                "SELECT block_num, timestamp, gas_used, base_fee_per_gas, transaction_count, total_tips
                 FROM block_cache WHERE block_num = ?",
                params![number as i64],
                row_to_record,
            );
            match result {
                Ok(record) => Ok(Some(record)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn store(&self, record: BlockRecord) -> FetcherResult<()> {
        let db = self.db.clone();
        blocking(move || {
            let conn = db.lock().map_err(|_| poisoned())?;
            conn.execute(
                "INSERT OR REPLACE INTO block_cache
                 (block_num, timestamp, gas_used, base_fee_per_gas, transaction_count, total_tips)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.number as i64,
                    record.timestamp as i64,
                    hex(record.gas_used),
                    hex(record.base_fee_per_gas),
                    record.transaction_count as i64,
                    hex(record.tips),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl<S: BlockSource> BlockSource for CachedBlockSource<S> {
    async fn chain_head(&self) -> FetcherResult<u64> {
        self.inner.chain_head().await
    }

    async fn fetch_block(&self, number: u64) -> FetcherResult<BlockRecord> {
        match self.lookup(number).await {
            Ok(Some(record)) => {
                debug!("block {} from cache", number);
                return Ok(record);
            }
            Ok(None) => {}
            Err(err) => warn!("Block cache read {}: {}", number, err),
        }

        let record = self.inner.fetch_block(number).await?;
        if let Err(err) = self.store(record.clone()).await {
            warn!("Block cache write {}: {}", number, err);
        }
        Ok(record)
    }
}

async fn blocking<T, F>(task: F) -> FetcherResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> FetcherResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| FetcherError::Storage(io::Error::new(io::ErrorKind::Other, err.to_string())))?
}

fn poisoned() -> FetcherError {
    FetcherError::Storage(io::Error::new(io::ErrorKind::Other, "block cache lock poisoned"))
}

fn hex(value: U256) -> String {
    format!("0x{:x}", value)
}

fn u256_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<U256> {
    let text: String = row.get(idx)?;
    U256::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("not a hex quantity: {}", text).into(),
        )
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<BlockRecord> {
    Ok(BlockRecord {
        number: row.get::<_, i64>(0)? as u64,
        timestamp: row.get::<_, i64>(1)? as u64,
        gas_used: u256_column(row, 2)?,
        base_fee_per_gas: u256_column(row, 3)?,
        transaction_count: row.get::<_, i64>(4)? as usize,
        tips: u256_column(row, 5)?,
    })
}
