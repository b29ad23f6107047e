use crate::error::FetcherError;
use crate::types::JobStatus;
use log::error;
use rocket::http::{Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::Serialize;
use tokio::fs::File;

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct SubmitResponse {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub status: JobStatus,
    pub start: u64,
    pub end: u64,
}

#[derive(rocket::Responder)]
#[response(status = 200, content_type = "text/csv")]
pub struct CsvAttachment {
    pub file: File,
    pub disposition: Header<'static>,
}

impl CsvAttachment {
    pub fn new(file: File, job_id: &str) -> Self {
        CsvAttachment {
            file,
            disposition: Header::new(
                "Content-Disposition",
                format!("attachment; filename=\"eth_blocks_{}.csv\"", job_id),
            ),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Fetcher(FetcherError),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Fetcher(err) => match err {
                FetcherError::NotFound(_) | FetcherError::ResultNotReady { .. } => Status::NotFound,
                FetcherError::InvalidRange { .. } => Status::BadRequest,
                FetcherError::InvalidTransition { .. } => Status::Conflict,
                FetcherError::UpstreamTransient(_) | FetcherError::UpstreamFatal(_) => {
                    Status::BadGateway
                }
                FetcherError::Storage(_) | FetcherError::Cache(_) => {
                    Status::InternalServerError
                }
            },
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(message) => f.write_str(message),
            ApiError::Fetcher(err) => write!(f, "{}", err),
        }
    }
}

impl From<FetcherError> for ApiError {
    fn from(err: FetcherError) -> Self {
        ApiError::Fetcher(err)
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            error!("{} {}: {}", req.method(), req.uri(), self);
        }
        let mut response = self.to_string().respond_to(req)?;
        response.set_status(status);
        Ok(response)
    }
}
