use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use super::errors::{Result, TranscodeError};
use super::settings::ProcessingSettings;

// 服务端时间戳可能是 RFC3339，也可能是不带时区的本地时间
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Ok(None),
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(|err| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, err)))
}

/// 本地任务唯一标识（提交前就存在）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned job identifier. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 服务端任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    #[default]
    #[serde(alias = "queued")]
    Queued,
    #[serde(alias = "processing")]
    Processing,
    #[serde(alias = "completed")]
    Completed,
    #[serde(alias = "failed")]
    Failed,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// COMPLETED and FAILED never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// 查询参数里使用小写
    pub fn as_query(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(TranscodeError::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Read-only projection of a server-side job
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(default, alias = "filename")]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub output_quality: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// `POST /v1/upload` 响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: JobId,
    #[serde(default, alias = "originalFilename")]
    pub filename: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 队列中的任务
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJob {
    pub id: JobId,
    #[serde(default, alias = "originalFilename")]
    pub file_name: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// `GET /v1/jobs/queued` 分页响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessingJobsResponse {
    pub jobs: Vec<ProcessingJob>,
    pub total: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub size: u32,
}

/// The queue endpoint answers either with a page or with a bare list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum QueuedJobsBody {
    Page(ProcessingJobsResponse),
    List(Vec<ProcessingJob>),
}

impl From<QueuedJobsBody> for ProcessingJobsResponse {
    fn from(body: QueuedJobsBody) -> Self {
        match body {
            QueuedJobsBody::Page(page) => page,
            QueuedJobsBody::List(jobs) => ProcessingJobsResponse {
                total: jobs.len() as u64,
                page: 0,
                size: jobs.len() as u32,
                jobs,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Processing,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecentActivity {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub time: String,
    pub status: ActivityStatus,
}

/// Dashboard metrics from `GET /media/system-stats`
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemStats {
    pub total_files_processed: u64,
    pub active_users: u64,
    pub total_processing_time: f64,
    pub storage_used: u64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub storage_usage: f64,
    #[serde(rename = "networkIO")]
    pub network_io: f64,
    pub files_in_queue: u64,
    pub avg_processing_time: f64,
    pub success_rate: f64,
    pub uptime: u64,
    pub recent_activity: Vec<RecentActivity>,
}

/// Job totals from `GET /media/stats`
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsResponse {
    pub total_jobs: u64,
    pub queued_jobs: u64,
    pub processing_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// 服务端已格式化，例如 "1.2 GB"
    pub total_data_processed: String,
    pub average_compression_ratio: f64,
}

/// `GET /media/health`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("up") || self.status.eq_ignore_ascii_case("ok")
    }
}

/// Paged job listing, `GET /v1/jobs?status&page&size`
#[derive(Debug, Clone, PartialEq)]
pub struct JobQuery {
    /// None 表示全部状态
    pub status: Option<JobStatus>,
    pub page: u32,
    pub size: u32,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            page: 0,
            size: 10,
        }
    }
}

impl JobQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let status = self.status.map(|status| status.as_query()).unwrap_or("all");

        vec![
            ("status", status.to_string()),
            ("page", self.page.to_string()),
            ("size", self.size.to_string()),
        ]
    }
}

/// 上传任务
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub settings: ProcessingSettings,
}

impl UploadTask {
    /// Builds a task from a local file; fails if the path is not a regular file
    pub async fn from_path(file_path: impl AsRef<Path>, settings: ProcessingSettings) -> Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&file_path).await?;
        if !metadata.is_file() {
            return Err(TranscodeError::InvalidSettings(format!("{} is not a file", file_path.display())));
        }

        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TranscodeError::InvalidSettings(format!("{} has no usable file name", file_path.display())))?
            .to_string();

        Ok(Self {
            id: TaskId::new(),
            file_path,
            file_name,
            file_size: metadata.len(),
            settings,
        })
    }
}

/// 客户端流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum JobPhase {
    /// 上传中
    Uploading,
    /// 轮询状态中
    Polling,
    /// 服务端处理完成（未下载）
    Completed,
    /// 已下载到本地
    Downloaded,
    /// 服务端处理失败
    Failed,
    /// 上传失败
    UploadFailed,
    /// 下载失败
    DownloadFailed,
    /// 轮询次数用尽，状态未知
    TimedOut,
    /// 已取消
    Cancelled,
}

impl JobPhase {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobPhase::Uploading | JobPhase::Polling)
    }
}

/// Client-side record of one file's journey through the pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackedJob {
    pub id: TaskId,
    pub file_name: String,
    pub job_id: Option<JobId>,
    pub phase: JobPhase,
    /// 最近一次服务端返回的状态
    pub last_status: Option<JobStatus>,
    pub attempts: u32,
    pub output_format: Option<String>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One status query of a poll loop
#[derive(Debug, Clone, PartialEq)]
pub struct PollAttempt {
    pub job_id: JobId,
    /// 1-based
    pub attempt: u32,
    pub elapsed: Duration,
}

/// How a poll loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(Job),
    Failed(Job),
    Exhausted {
        attempts: u32,
        last_status: Option<JobStatus>,
    },
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// 上传成功，已拿到 job id
    Submitted {
        task_id: TaskId,
        job_id: JobId,
    },

    /// 上传字节进度
    UploadProgress {
        task_id: TaskId,
        bytes_sent: u64,
        total_bytes: u64,
    },

    UploadFailed {
        task_id: TaskId,
        error: String,
    },

    /// 服务端状态变更
    StatusChanged {
        task_id: TaskId,
        job_id: JobId,
        old_status: Option<JobStatus>,
        new_status: JobStatus,
    },

    PollExhausted {
        task_id: TaskId,
        job_id: JobId,
        attempts: u32,
    },

    Completed {
        task_id: TaskId,
        job_id: JobId,
    },

    Failed {
        task_id: TaskId,
        job_id: JobId,
        error: String,
    },

    Downloaded {
        task_id: TaskId,
        job_id: JobId,
        path: PathBuf,
    },

    DownloadFailed {
        task_id: TaskId,
        job_id: JobId,
        error: String,
    },

    Cancelled {
        task_id: TaskId,
    },
}

/// 管理器命令
pub enum ManagerCommand {
    /// 提交单个文件
    Submit {
        task: UploadTask,
        reply: oneshot::Sender<Result<TaskId>>,
    },

    /// 批量提交
    SubmitBatch {
        tasks: Vec<UploadTask>,
        reply: oneshot::Sender<Vec<TaskId>>,
    },

    /// 轮询已存在的 job
    Watch {
        job_id: JobId,
        file_name: String,
        output_format: Option<String>,
        reply: oneshot::Sender<Result<TaskId>>,
    },

    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelAll {
        reply: oneshot::Sender<usize>,
    },

    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TrackedJob>>,
    },

    GetAllTasks {
        reply: oneshot::Sender<Vec<TrackedJob>>,
    },

    /// 所有流水线结束后回复
    WaitIdle {
        reply: oneshot::Sender<Vec<TrackedJob>>,
    },
}

// 事件需要跨任务发送
const _: () = {
    fn assert_send<T: Send>() {}
    fn assert_types() {
        assert_send::<UploadTask>();
        assert_send::<JobEvent>();
        assert_send::<TrackedJob>();
    }
};
