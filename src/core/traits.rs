use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use super::errors::Result;
use super::types::{
    HealthStatus,
    Job,
    JobId,
    JobQuery,
    JobStatus,
    ProcessingJobsResponse,
    StatsResponse,
    SystemStats,
    UploadResponse,
    UploadTask,
};

/// Transcoding API transport. [`crate::api::HttpJobClient`] talks HTTP; tests
/// script their own.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// 上传文件并创建 job。`progress_tx` 收到累计已发送字节数
    async fn upload(&self, task: &UploadTask, progress_tx: Option<UnboundedSender<u64>>) -> Result<UploadResponse>;

    /// 查询单个 job
    async fn get_job(&self, job_id: &JobId) -> Result<Job>;

    /// 下载处理后的文件
    async fn download(&self, job_id: &JobId) -> Result<Bytes>;

    /// 队列中的 job
    async fn queued_jobs(&self) -> Result<ProcessingJobsResponse>;

    /// 某个状态下的全部 job
    async fn jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// 分页列出 job
    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// 删除/取消 job
    async fn delete_job(&self, job_id: &JobId) -> Result<()>;

    /// 仪表盘统计
    async fn system_stats(&self) -> Result<SystemStats>;

    /// job 数量汇总
    async fn stats(&self) -> Result<StatsResponse>;

    async fn health(&self) -> Result<HealthStatus>;
}

/// Key/value persistence port for client view state
pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;

    fn save(&self, key: &str, value: &str) -> Result<()>;
}
