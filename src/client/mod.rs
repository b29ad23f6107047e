use bytes::Bytes;
use reqwest::{Response, Url};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid server url {0}")]
    InvalidServer(String),
    #[error("Request failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// HTTP client for the job server.
pub struct FetcherClient {
    server: Url,
    http: reqwest::Client,
}

impl FetcherClient {
    pub fn new(server: &str) -> Result<Self, ClientError> {
        let server =
            Url::parse(server).map_err(|_| ClientError::InvalidServer(server.to_string()))?;
        if server.cannot_be_a_base() {
            return Err(ClientError::InvalidServer(server.to_string()));
        }
        Ok(FetcherClient {
            server,
            http: reqwest::Client::new(),
        })
    }

    pub async fn request(&self, start: u64, end: u64) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.url(&["request"]))
            .query(&[("start", start), ("end", end)])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn status(&self, job_id: &str) -> Result<Value, ClientError> {
        let response = self.http.get(self.url(&["status", job_id])).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn stop(&self, job_id: &str) -> Result<String, ClientError> {
        let response = self.http.get(self.url(&["stop", job_id])).send().await?;
        Ok(check(response).await?.text().await?)
    }

    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let response = self.http.get(self.url(&["jobs"])).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Save a completed job's CSV to `output`. Nothing is written unless the server answers 200.
    pub async fn download(&self, job_id: &str, output: &Path) -> Result<usize, ClientError> {
        let response = self.http.get(self.url(&["download", job_id])).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                body: response.text().await?,
            });
        }
        let body: Bytes = response.bytes().await?;
        tokio::fs::write(output, &body).await?;
        Ok(body.len())
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.server.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(ClientError::Status {
        status: status.as_u16(),
        body: response.text().await?,
    })
}
