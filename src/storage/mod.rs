use crate::error::{FetcherError, FetcherResult};
use crate::types::{BlockChunk, BlockRecord};
#[cfg(test)]
use crate::types::FetchResult;
use crate::util::display_path;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

pub const CSV_HEADER: &str =
    "block_number,timestamp,gas_used,base_fee_per_gas,transaction_count,tips\n";

const RESULT_EXT: &str = "csv";
const PARTIAL_EXT: &str = "csv.part";

/// Completed job artifacts, one `<job_id>.csv` per job under `result_path`.
pub struct ResultStorage {
    result_path: PathBuf,
}

/// Streaming CSV writer for one job.
///
/// Chunks go through a channel to a background task writing `<job_id>.csv.part`.
/// `commit` renames the file to its final name; dropping or aborting the writer
/// deletes the partial file, so readers never see an incomplete result.
pub struct ResultWriter {
    job_id: String,
    sender: Sender<Option<BlockChunk>>,
    worker: JoinHandle<FetcherResult<Option<u64>>>,
}

impl ResultStorage {
    pub fn new(result_path: PathBuf) -> FetcherResult<Self> {
        info!("Result storage:{}", display_path(&result_path));
        fs::create_dir_all(&result_path)?;
        // leftovers of jobs interrupted by a restart
        for entry in fs::read_dir(&result_path)? {
            let path = entry?.path();
            if display_path(&path).ends_with(PARTIAL_EXT) {
                warn!("Remove stale partial result:{}", display_path(&path));
                fs::remove_file(&path)?;
            }
        }
        Ok(ResultStorage { result_path })
    }

    pub async fn open_writer(&self, job_id: &str) -> FetcherResult<ResultWriter> {
        let result_file = self.result_file(job_id)?;
        let partial_file = self.file_for(job_id, PARTIAL_EXT)?;
        let (sender, rcv) = mpsc::channel::<Option<BlockChunk>>(8);
        info!(
            "[{}] Start result writer. Result file:{}",
            job_id,
            display_path(&result_file)
        );

        let _job_id = job_id.to_string();
        let worker: JoinHandle<FetcherResult<Option<u64>>> = spawn(async move {
            let written = write_rows(&partial_file, rcv).await;
            match written {
                Ok(Some(rows)) => {
                    if let Err(err) = tokio::fs::rename(&partial_file, &result_file).await {
                        error!("[{}] Cannot publish result: {}", _job_id, err);
                        remove_quietly(&partial_file).await;
                        return Err(err.into());
                    }
                    info!("[{}] Stop result writer. Rows:{}", _job_id, rows);
                    Ok(Some(rows))
                }
                Ok(None) => {
                    info!("[{}] Result writer aborted", _job_id);
                    remove_quietly(&partial_file).await;
                    Ok(None)
                }
                Err(err) => {
                    error!("[{}] Result writer failed: {}", _job_id, err);
                    remove_quietly(&partial_file).await;
                    Err(err)
                }
            }
        });

        Ok(ResultWriter {
            job_id: job_id.to_string(),
            sender,
            worker,
        })
    }

    /// Persist a complete result in one go.
    #[cfg(test)]
    pub async fn put(&self, job_id: &str, result: FetchResult) -> FetcherResult<u64> {
        let writer = self.open_writer(job_id).await?;
        if let Err(err) = writer.write(BlockChunk { blocks: result.blocks }).await {
            return Err(writer.abort().await.err().unwrap_or(err));
        }
        writer.commit().await
    }

    /// Open the committed CSV of a job.
    pub async fn get(&self, job_id: &str) -> FetcherResult<File> {
        let path = self.result_file(job_id)?;
        match File::open(&path).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FetcherError::NotFound(job_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        match self.result_file(job_id) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn result_file(&self, job_id: &str) -> FetcherResult<PathBuf> {
        self.file_for(job_id, RESULT_EXT)
    }

    fn file_for(&self, job_id: &str, ext: &str) -> FetcherResult<PathBuf> {
        // job ids are file names; anything that could leave result_path is unknown
        if job_id.is_empty()
            || job_id.starts_with('.')
            || job_id.contains(|c| c == '/' || c == '\\')
        {
            return Err(FetcherError::NotFound(job_id.to_string()));
        }
        Ok(self.result_path.join(format!("{}.{}", job_id, ext)))
    }
}

impl ResultWriter {
    pub async fn write(&self, chunk: BlockChunk) -> FetcherResult<()> {
        self.sender.send(Some(chunk)).await.map_err(|_| {
            FetcherError::Storage(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("result writer of job {} stopped", self.job_id),
            ))
        })
    }

    /// Flush and publish the result. Returns the number of rows written.
    pub async fn commit(self) -> FetcherResult<u64> {
        if self.sender.send(None).await.is_err() {
            warn!("[{}] Result writer closed before commit", self.job_id);
        }
        match join(self.worker).await? {
            Some(rows) => Ok(rows),
            None => Err(FetcherError::Storage(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                format!("result of job {} was not committed", self.job_id),
            ))),
        }
    }

    /// Discard everything written so far.
    pub async fn abort(self) -> FetcherResult<()> {
        drop(self.sender);
        join(self.worker).await.map(|_| ())
    }
}

async fn join(worker: JoinHandle<FetcherResult<Option<u64>>>) -> FetcherResult<Option<u64>> {
    worker.await.map_err(|err| {
        FetcherError::Storage(std::io::Error::new(std::io::ErrorKind::Other, err))
    })?
}

// Ok(Some(rows)) on commit, Ok(None) when the sender went away first.
async fn write_rows(
    path: &Path,
    mut rcv: Receiver<Option<BlockChunk>>,
) -> FetcherResult<Option<u64>> {
    let mut out = BufWriter::new(File::create(path).await?);
    out.write_all(CSV_HEADER.as_bytes()).await?;
    let mut rows = 0u64;

    while let Some(chunk) = rcv.recv().await {
        let Some(chunk) = chunk else {
            out.flush().await?;
            out.get_ref().sync_all().await?;
            return Ok(Some(rows));
        };
        for block in &chunk.blocks {
            out.write_all(csv_row(block).as_bytes()).await?;
            rows += 1;
        }
    }

    Ok(None)
}

pub fn csv_row(block: &BlockRecord) -> String {
    format!(
        "{},{},{},{},{},{}\n",
        block.number,
        block.timestamp,
        block.gas_used,
        block.base_fee_per_gas,
        block.transaction_count,
        block.tips
    )
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("Cannot remove {}: {}", display_path(path), err);
        }
    }
}
