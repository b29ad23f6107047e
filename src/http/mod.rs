mod types;

use crate::error::FetcherError;
use crate::http::types::{ApiError, CsvAttachment, SubmitResponse};
use crate::registry::JobRegistry;
use crate::scheduler::{Scheduler, StopOutcome};
use crate::storage::ResultStorage;
use crate::types::{Job, JobStatus};
use log::info;
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Rocket, State};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<JobRegistry>,
    pub result_storage: Arc<ResultStorage>,
}

pub struct HttpApi {}

impl HttpApi {
    /// Serve the job API until rocket receives a shutdown signal.
    pub async fn launch(address: &str, port: u16, state: ApiState) -> anyhow::Result<()> {
        let address: IpAddr = address.parse()?;
        info!("Http api {}:{}", address, port);
        let config = rocket::Config {
            address,
            port,
            ..rocket::Config::default()
        };
        build_rocket(config, state)
            .launch()
            .await
            .map_err(|err| anyhow::anyhow!("Http api error: {}", err))?;
        Ok(())
    }
}

pub fn build_rocket(config: rocket::Config, state: ApiState) -> Rocket<Build> {
    rocket::custom(config).manage(state).mount(
        "/",
        routes![request_job, job_status, stop_job, download, list_jobs, health],
    )
}

// Example: POST /request?start=17000000&end=17000100
#[post("/request?<start>&<end>")]
async fn request_job(
    state: &State<ApiState>,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let start = start.ok_or(ApiError::BadRequest("Invalid start block"))?;
    let end = end.ok_or(ApiError::BadRequest("Invalid end block"))?;
    let job = state.scheduler.submit(start, end).await?;

    Ok(Json(SubmitResponse {
        job_id: job.id,
        status: job.status,
        start: job.start,
        end: job.end,
    }))
}

#[get("/status/<job_id>")]
async fn job_status(state: &State<ApiState>, job_id: &str) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.registry.get(job_id).await?))
}

#[get("/stop/<job_id>")]
async fn stop_job(state: &State<ApiState>, job_id: &str) -> Result<&'static str, ApiError> {
    match state.scheduler.stop(job_id).await? {
        StopOutcome::Dequeued => Ok("Job removed from queue"),
        StopOutcome::Cancelling => Ok("Stopping job"),
    }
}

#[get("/download/<job_id>")]
async fn download(state: &State<ApiState>, job_id: &str) -> Result<CsvAttachment, ApiError> {
    let job = state.registry.get(job_id).await?;
    if job.status != JobStatus::Completed {
        return Err(FetcherError::ResultNotReady {
            job_id: job.id,
            status: job.status,
        }
        .into());
    }
    if !state.result_storage.contains(job_id).await {
        return Err(FetcherError::Storage(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Result file of completed job {} is missing", job_id),
        ))
        .into());
    }
    let file = state.result_storage.get(job_id).await?;
    Ok(CsvAttachment::new(file, job_id))
}

#[get("/jobs")]
async fn list_jobs(state: &State<ApiState>) -> Json<Vec<String>> {
    Json(state.registry.list().await)
}

#[get("/health")]
fn health() -> &'static str {
    "OK"
}
