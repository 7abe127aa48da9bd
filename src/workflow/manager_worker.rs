use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::core::{
    JobApi,
    JobEvent,
    JobId,
    JobPhase,
    JobStatus,
    ManagerCommand,
    Result,
    TaskId,
    TrackedJob,
    TranscodeError,
    UploadTask,
};
use super::download::Downloader;
use super::manager::WorkflowConfig;
use super::pipeline::{JobPipeline, PipelineOutcome, PipelineUpdate, Stage};

struct TaskHandle {
    job: TrackedJob,
    cancellation_token: CancellationToken,
    running: bool,
}

pub(crate) struct JobManagerWorker {
    api: Arc<dyn JobApi>,
    config: WorkflowConfig,
    tasks: HashMap<TaskId, TaskHandle>,
    /// job id -> 正在跟踪它的任务，保证每个 job 只有一个轮询循环
    polling: HashMap<JobId, TaskId>,
    running: usize,
    cancellation_token: CancellationToken,
    idle_waiters: Vec<oneshot::Sender<Vec<TrackedJob>>>,

    event_tx: broadcast::Sender<JobEvent>,
    update_tx: mpsc::UnboundedSender<PipelineUpdate>,
    update_rx: mpsc::UnboundedReceiver<PipelineUpdate>,
}

impl JobManagerWorker {
    pub(crate) async fn run(
        api: Arc<dyn JobApi>,
        config: WorkflowConfig,
        cancellation_token: CancellationToken,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        event_tx: broadcast::Sender<JobEvent>,
    ) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let mut worker = Self {
            api,
            config,
            tasks: HashMap::new(),
            polling: HashMap::new(),
            running: 0,
            cancellation_token,
            idle_waiters: Vec::new(),
            event_tx,
            update_tx,
            update_rx,
        };

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => worker.handle_command(command),
                    None => break,
                },
                Some(update) = worker.update_rx.recv() => {
                    worker.handle_update(update);
                }
            }

            worker.notify_idle();
        }

        // 所有句柄都已释放，取消剩余的流水线并等待它们汇报结束
        worker.cancellation_token.cancel();
        while worker.running > 0 {
            match worker.update_rx.recv().await {
                Some(update) => worker.handle_update(update),
                None => break,
            }
        }

        debug!("Job manager worker stopped");
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Submit { task, reply } => {
                let result = self.submit(task);
                let _ = reply.send(result);
            }
            ManagerCommand::SubmitBatch { tasks, reply } => {
                // 单个文件失败不影响其他文件
                let ids = tasks
                    .into_iter()
                    .filter_map(|task| {
                        let file_name = task.file_name.clone();
                        self.submit(task)
                            .inspect_err(|err| warn!(file = %file_name, error = %err, "Rejected task"))
                            .ok()
                    })
                    .collect();
                let _ = reply.send(ids);
            }
            ManagerCommand::Watch { job_id, file_name, output_format, reply } => {
                let result = self.watch(job_id, file_name, output_format);
                let _ = reply.send(result);
            }
            ManagerCommand::Cancel { task_id, reply } => {
                let result = self.cancel(task_id);
                let _ = reply.send(result);
            }
            ManagerCommand::CancelAll { reply } => {
                let cancelled = self.cancel_all();
                let _ = reply.send(cancelled);
            }
            ManagerCommand::GetTask { task_id, reply } => {
                let task = self.tasks
                    .get(&task_id)
                    .map(|handle| handle.job.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::GetAllTasks { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ManagerCommand::WaitIdle { reply } => {
                self.idle_waiters.push(reply);
            }
        }
    }

    fn new_pipeline(&self, cancellation_token: CancellationToken) -> JobPipeline {
        let downloader = self.config.download_dir
            .as_ref()
            .map(|dir| Downloader::new(self.api.clone(), dir.clone()));

        JobPipeline {
            api: self.api.clone(),
            poll_config: self.config.poll.clone(),
            downloader,
            cancellation_token,
            update_tx: self.update_tx.clone(),
        }
    }

    fn track(&mut self, task_id: TaskId, file_name: String, job_id: Option<JobId>, phase: JobPhase) -> CancellationToken {
        let cancellation_token = self.cancellation_token.child_token();
        let job = TrackedJob {
            id: task_id,
            file_name,
            job_id,
            phase,
            last_status: None,
            attempts: 0,
            output_format: None,
            output_path: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        self.tasks.insert(task_id, TaskHandle {
            job,
            cancellation_token: cancellation_token.clone(),
            running: true,
        });
        self.running += 1;

        cancellation_token
    }

    fn submit(&mut self, task: UploadTask) -> Result<TaskId> {
        if self.cancellation_token.is_cancelled() {
            return Err(TranscodeError::ManagerShutdown);
        }

        let task_id = task.id;
        if self.tasks.contains_key(&task_id) {
            return Err(TranscodeError::internal_error(format!("Task {} submitted twice", task_id)));
        }

        let cancellation_token = self.track(task_id, task.file_name.clone(), None, JobPhase::Uploading);
        let pipeline = self.new_pipeline(cancellation_token);
        tokio::spawn(pipeline.run_upload(task));

        Ok(task_id)
    }

    fn watch(&mut self, job_id: JobId, file_name: String, output_format: Option<String>) -> Result<TaskId> {
        if self.cancellation_token.is_cancelled() {
            return Err(TranscodeError::ManagerShutdown);
        }
        if self.polling.contains_key(&job_id) {
            return Err(TranscodeError::AlreadyPolling(job_id.to_string()));
        }

        let task_id = TaskId::new();
        let cancellation_token = self.track(task_id, file_name.clone(), Some(job_id.clone()), JobPhase::Polling);
        self.polling.insert(job_id.clone(), task_id);

        let pipeline = self.new_pipeline(cancellation_token);
        let requested = output_format.unwrap_or_default();
        tokio::spawn(async move {
            pipeline.follow(task_id, job_id, &file_name, &requested).await;
        });

        Ok(task_id)
    }

    fn cancel(&mut self, task_id: TaskId) -> Result<()> {
        let handle = self.tasks.get(&task_id).ok_or(TranscodeError::TaskNotFound)?;

        if handle.running {
            handle.cancellation_token.cancel();
        }

        Ok(())
    }

    fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for handle in self.tasks.values().filter(|handle| handle.running) {
            handle.cancellation_token.cancel();
            cancelled += 1;
        }

        cancelled
    }

    fn handle_update(&mut self, update: PipelineUpdate) {
        let PipelineUpdate { task_id, stage } = update;
        let handle = match self.tasks.get_mut(&task_id) {
            Some(handle) => handle,
            None => return,
        };
        let tracked = &mut handle.job;

        match stage {
            Stage::UploadProgress { bytes_sent, total_bytes } => {
                if tracked.phase == JobPhase::Uploading {
                    let _ = self.event_tx.send(JobEvent::UploadProgress { task_id, bytes_sent, total_bytes });
                }
            }
            Stage::Submitted { job_id, status } => {
                tracked.job_id = Some(job_id.clone());
                tracked.last_status = Some(status);
                tracked.phase = JobPhase::Polling;
                self.polling.insert(job_id.clone(), task_id);
                let _ = self.event_tx.send(JobEvent::Submitted { task_id, job_id });
            }
            Stage::Polled { attempt, job } => {
                tracked.attempts = attempt;

                let Some(job) = job else {
                    return;
                };

                if job.output_format.is_some() {
                    tracked.output_format = job.output_format.clone();
                }

                let old_status = tracked.last_status;
                tracked.last_status = Some(job.status);
                if old_status != Some(job.status) {
                    let _ = self.event_tx.send(JobEvent::StatusChanged {
                        task_id,
                        job_id: job.id.clone(),
                        old_status,
                        new_status: job.status,
                    });
                }

                if job.status == JobStatus::Completed {
                    tracked.phase = JobPhase::Completed;
                    info!(file = %tracked.file_name, job_id = %job.id, "Processing complete");
                    let _ = self.event_tx.send(JobEvent::Completed { task_id, job_id: job.id });
                }
            }
            Stage::Finished(outcome) => {
                self.finish(task_id, outcome);
            }
        }
    }

    fn finish(&mut self, task_id: TaskId, outcome: PipelineOutcome) {
        let handle = match self.tasks.get_mut(&task_id) {
            Some(handle) if handle.running => handle,
            _ => return,
        };

        handle.running = false;
        self.running -= 1;

        let tracked = &mut handle.job;
        tracked.finished_at = Some(Utc::now());
        if let Some(job_id) = &tracked.job_id {
            if self.polling.get(job_id) == Some(&task_id) {
                self.polling.remove(job_id);
            }
        }

        let job_id = tracked.job_id.clone();
        let event = match outcome {
            PipelineOutcome::UploadFailed(error) => {
                tracked.phase = JobPhase::UploadFailed;
                tracked.error = Some(error.clone());
                Some(JobEvent::UploadFailed { task_id, error })
            }
            PipelineOutcome::Failed(error) => {
                tracked.phase = JobPhase::Failed;
                tracked.error = Some(error.clone());
                job_id.map(|job_id| JobEvent::Failed { task_id, job_id, error })
            }
            PipelineOutcome::TimedOut { attempts } => {
                tracked.phase = JobPhase::TimedOut;
                warn!(file = %tracked.file_name, attempts, "Job still not finished after the last status query");
                job_id.map(|job_id| JobEvent::PollExhausted { task_id, job_id, attempts })
            }
            PipelineOutcome::Completed => {
                tracked.phase = JobPhase::Completed;
                None
            }
            PipelineOutcome::Downloaded(path) => {
                tracked.phase = JobPhase::Downloaded;
                tracked.output_path = Some(path.clone());
                job_id.map(|job_id| JobEvent::Downloaded { task_id, job_id, path })
            }
            PipelineOutcome::DownloadFailed(error) => {
                tracked.phase = JobPhase::DownloadFailed;
                tracked.error = Some(error.clone());
                job_id.map(|job_id| JobEvent::DownloadFailed { task_id, job_id, error })
            }
            PipelineOutcome::Cancelled => {
                tracked.phase = JobPhase::Cancelled;
                Some(JobEvent::Cancelled { task_id })
            }
        };

        if let Some(event) = event {
            let _ = self.event_tx.send(event);
        }
    }

    fn snapshot(&self) -> Vec<TrackedJob> {
        let mut jobs: Vec<_> = self.tasks
            .values()
            .map(|handle| handle.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);

        jobs
    }

    fn notify_idle(&mut self) {
        if self.running > 0 || self.idle_waiters.is_empty() {
            return;
        }

        let jobs = self.snapshot();
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(jobs.clone());
        }
    }
}
