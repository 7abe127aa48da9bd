use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;
use crate::core::{
    HealthStatus,
    Job,
    JobApi,
    JobId,
    JobQuery,
    JobStatus,
    ProcessingJobsResponse,
    QueuedJobsBody,
    Result,
    StatsResponse,
    SystemStats,
    TranscodeError,
    UploadResponse,
    UploadTask,
};
use super::progress_stream::ProgressStream;

/// 读取文件时的缓冲大小
const UPLOAD_BUFFER_SIZE: usize = 256 * 1024;

/// 错误信息最多保留的响应体长度
const MAX_ERROR_BODY: usize = 200;

/// Job listings come back as a bare list or wrapped in a page
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobListBody {
    List(Vec<Job>),
    Page { jobs: Vec<Job> },
}

impl From<JobListBody> for Vec<Job> {
    fn from(body: JobListBody) -> Self {
        match body {
            JobListBody::List(jobs) | JobListBody::Page { jobs } => jobs,
        }
    }
}

/// HTTP transport for the transcoding API
#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: Client,
    endpoint: Url,
}

impl HttpJobClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| TranscodeError::Config(format!("Invalid url {:?}: {}", endpoint, err)))?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(TranscodeError::Config(format!("Unsupported scheme: {}", endpoint.scheme())));
        }
        if endpoint.cannot_be_a_base() {
            return Err(TranscodeError::Config(format!("Endpoint cannot be a base url: {}", endpoint)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(Self::create_headers())
            .build()?;

        Ok(Self { client, endpoint })
    }

    pub fn create_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        headers
    }

    /// Appends path segments to the endpoint, percent-encoding each one
    pub fn build_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TranscodeError::internal_error("Endpoint cannot be a base url"))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    pub fn list_url(&self, query: &JobQuery) -> Result<Url> {
        let mut url = self.build_url(&["v1", "jobs"])?;
        url.query_pairs_mut().extend_pairs(query.query_pairs());

        Ok(url)
    }

    /// Non-2xx responses become `ServerError` with a snippet of the body
    async fn ensure_success(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("request failed").to_string()
        } else {
            body.chars().take(MAX_ERROR_BODY).collect()
        };

        Err(TranscodeError::server_error(status.as_u16(), message))
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = Self::ensure_success(response).await?;
        let body = response.bytes().await?;

        Ok(serde_json::from_slice(&body)?)
    }

    async fn build_form(task: &UploadTask, progress_tx: Option<UnboundedSender<u64>>) -> Result<Form> {
        let file = File::open(&task.file_path).await?;
        let file_stream = ReaderStream::with_capacity(file, UPLOAD_BUFFER_SIZE);

        let body = match progress_tx {
            Some(progress_tx) => reqwest::Body::wrap_stream(ProgressStream::new(file_stream, progress_tx)),
            None => reqwest::Body::wrap_stream(file_stream),
        };

        let part = Part::stream_with_length(body, task.file_size)
            .file_name(task.file_name.clone())
            .mime_str("application/octet-stream")?;

        let mut form = Form::new().part("file", part);
        for (name, value) in task.settings.form_fields() {
            form = form.text(name, value);
        }

        Ok(form)
    }
}

#[async_trait]
impl JobApi for HttpJobClient {
    async fn upload(&self, task: &UploadTask, progress_tx: Option<UnboundedSender<u64>>) -> Result<UploadResponse> {
        let url = self.build_url(&["v1", "upload"])?;
        let form = Self::build_form(task, progress_tx).await?;

        debug!(file = %task.file_name, size = task.file_size, %url, "Uploading file");

        let response = self.client
            .post(url)
            .multipart(form)
            .send()
            .await?;

        Self::read_json(response).await
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        let url = self.build_url(&["v1", "jobs", job_id.as_str()])?;
        let response = self.client.get(url).send().await?;

        Self::read_json(response).await
    }

    async fn download(&self, job_id: &JobId) -> Result<Bytes> {
        let url = self.build_url(&["v1", "jobs", job_id.as_str(), "download"])?;
        let response = self.client.get(url).send().await?;
        let response = Self::ensure_success(response).await?;

        Ok(response.bytes().await?)
    }

    async fn queued_jobs(&self) -> Result<ProcessingJobsResponse> {
        let url = self.build_url(&["v1", "jobs", "queued"])?;
        let response = self.client.get(url).send().await?;
        let body: QueuedJobsBody = Self::read_json(response).await?;

        Ok(body.into())
    }

    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let url = self.build_url(&["v1", "jobs", "status", &status.to_string()])?;
        let response = self.client.get(url).send().await?;

        Self::read_json(response).await
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let url = self.list_url(query)?;
        let response = self.client.get(url).send().await?;
        let body: JobListBody = Self::read_json(response).await?;

        Ok(body.into())
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let url = self.build_url(&["v1", "jobs", job_id.as_str()])?;
        let response = self.client.delete(url).send().await?;

        // 已经不存在的 job 视为删除成功
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%job_id, "Job already gone");
            return Ok(());
        }

        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn system_stats(&self) -> Result<SystemStats> {
        let url = self.build_url(&["media", "system-stats"])?;
        let response = self.client.get(url).send().await?;

        Self::read_json(response).await
    }

    async fn stats(&self) -> Result<StatsResponse> {
        let url = self.build_url(&["media", "stats"])?;
        let response = self.client.get(url).send().await?;

        Self::read_json(response).await
    }

    async fn health(&self) -> Result<HealthStatus> {
        let url = self.build_url(&["media", "health"])?;
        let response = self.client.get(url).send().await?;

        Self::read_json(response).await
    }
}
