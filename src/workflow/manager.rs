use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::core::{JobApi, JobEvent, JobId, ManagerCommand, Result, TaskId, TrackedJob, TranscodeError, UploadTask};
use super::manager_worker::JobManagerWorker;
use super::poller::PollConfig;

/// 工作流配置
#[derive(Debug, Clone, Default)]
pub struct WorkflowConfig {
    pub poll: PollConfig,
    /// 为 None 时只轮询，不自动下载
    pub download_dir: Option<PathBuf>,
}

/// Cloneable handle to the job manager.
///
/// Every submitted file gets its own pipeline task; the worker behind this
/// handle is the only owner of the per-task records.
#[derive(Clone)]
pub struct JobManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    event_tx: broadcast::Sender<JobEvent>,
    cancellation_token: CancellationToken,
}

/// 管理器句柄 - 包含管理器和工作任务
pub struct JobManagerHandle {
    pub manager: JobManager,
    pub worker_handle: JoinHandle<()>,
}

impl JobManagerHandle {
    /// Cancels every pipeline and waits for the worker to drain.
    ///
    /// The worker only stops once all clones of the manager are dropped.
    pub async fn shutdown(self) -> Result<()> {
        self.manager.shutdown();
        drop(self.manager);
        self.worker_handle.await
            .map_err(|err| TranscodeError::internal_error(format!("Worker panic: {}", err)))
    }
}

impl JobManager {
    pub fn new(api: Arc<dyn JobApi>, config: WorkflowConfig) -> JobManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);
        let cancellation_token = CancellationToken::new();

        let worker_handle = tokio::spawn(JobManagerWorker::run(
            api,
            config,
            cancellation_token.clone(),
            command_rx,
            event_tx.clone(),
        ));

        let manager = Self {
            command_tx,
            event_tx,
            cancellation_token,
        };

        JobManagerHandle {
            manager,
            worker_handle,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| TranscodeError::ManagerShutdown)?;

        reply_rx.await.map_err(|_| TranscodeError::ManagerShutdown)
    }

    /// Submit one file
    pub async fn submit(&self, task: UploadTask) -> Result<TaskId> {
        self.request(|reply| ManagerCommand::Submit { task, reply }).await?
    }

    /// Submit many files, each in its own pipeline
    pub async fn submit_batch(&self, tasks: Vec<UploadTask>) -> Result<Vec<TaskId>> {
        self.request(|reply| ManagerCommand::SubmitBatch { tasks, reply }).await
    }

    /// Follow a job created earlier. Fails with `AlreadyPolling` when a
    /// pipeline for `job_id` is still running.
    pub async fn watch(&self, job_id: JobId, file_name: impl Into<String>, output_format: Option<String>) -> Result<TaskId> {
        let file_name = file_name.into();
        self.request(|reply| ManagerCommand::Watch { job_id, file_name, output_format, reply }).await?
    }

    /// Cancel a pipeline
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.request(|reply| ManagerCommand::Cancel { task_id, reply }).await?
    }

    /// Cancel every running pipeline, returns how many were running
    pub async fn cancel_all(&self) -> Result<usize> {
        self.request(|reply| ManagerCommand::CancelAll { reply }).await
    }

    /// Get task
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<TrackedJob>> {
        self.request(|reply| ManagerCommand::GetTask { task_id, reply }).await
    }

    /// Get all tasks
    pub async fn get_all_tasks(&self) -> Result<Vec<TrackedJob>> {
        self.request(|reply| ManagerCommand::GetAllTasks { reply }).await
    }

    /// Resolves once no pipeline is running
    pub async fn wait_all(&self) -> Result<Vec<TrackedJob>> {
        self.request(|reply| ManagerCommand::WaitIdle { reply }).await
    }

    /// Cancels all pipelines; later submissions are refused
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// 订阅事件
    ///
    /// 接收太慢会丢失事件（lagged error）
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }
}
