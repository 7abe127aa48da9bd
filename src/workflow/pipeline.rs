use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::core::{Job, JobApi, JobId, JobStatus, PollOutcome, TaskId, UploadTask};
use super::download::{Downloader, resolve_output_format};
use super::poller::{JobPoller, PollConfig};
use super::submit::submit;

/// 流水线向管理器汇报的阶段
#[derive(Debug)]
pub(crate) enum Stage {
    UploadProgress {
        bytes_sent: u64,
        total_bytes: u64,
    },
    Submitted {
        job_id: JobId,
        status: JobStatus,
    },
    /// `job` 为 None 表示这次查询出错
    Polled {
        attempt: u32,
        job: Option<Job>,
    },
    Finished(PipelineOutcome),
}

#[derive(Debug)]
pub(crate) enum PipelineOutcome {
    UploadFailed(String),
    Failed(String),
    TimedOut { attempts: u32 },
    /// 处理完成，未配置下载
    Completed,
    Downloaded(PathBuf),
    DownloadFailed(String),
    Cancelled,
}

#[derive(Debug)]
pub(crate) struct PipelineUpdate {
    pub task_id: TaskId,
    pub stage: Stage,
}

/// One file's submit → poll → download run. Owns no shared state; every
/// observation goes back to the manager over `update_tx`.
pub(crate) struct JobPipeline {
    pub(crate) api: Arc<dyn JobApi>,
    pub(crate) poll_config: PollConfig,
    pub(crate) downloader: Option<Downloader>,
    pub(crate) cancellation_token: CancellationToken,
    pub(crate) update_tx: mpsc::UnboundedSender<PipelineUpdate>,
}

impl JobPipeline {
    fn report(&self, task_id: TaskId, stage: Stage) {
        let _ = self.update_tx.send(PipelineUpdate { task_id, stage });
    }

    /// Uploads the file, then follows the created job
    pub(crate) async fn run_upload(self, task: UploadTask) {
        let task_id = task.id;
        let total_bytes = task.file_size;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        // 转发上传进度
        tokio::spawn({
            let update_tx = self.update_tx.clone();
            async move {
                while let Some(bytes_sent) = progress_rx.recv().await {
                    let _ = update_tx.send(PipelineUpdate {
                        task_id,
                        stage: Stage::UploadProgress { bytes_sent, total_bytes },
                    });
                }
            }
        });

        let result = tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                self.report(task_id, Stage::Finished(PipelineOutcome::Cancelled));
                return;
            }
            result = submit(self.api.as_ref(), &task, Some(progress_tx)) => result,
        };

        match result {
            Ok(response) => {
                self.report(task_id, Stage::Submitted {
                    job_id: response.id.clone(),
                    status: response.status,
                });

                let requested = task.settings.format().to_string();
                self.follow(task_id, response.id, &task.file_name, &requested).await;
            }
            Err(err) => {
                self.report(task_id, Stage::Finished(PipelineOutcome::UploadFailed(err.to_string())));
            }
        }
    }

    /// Polls an existing job and downloads its result when configured
    pub(crate) async fn follow(&self, task_id: TaskId, job_id: JobId, file_name: &str, requested_format: &str) {
        let poller = JobPoller::new(self.api.clone(), self.poll_config.clone());

        let outcome = poller
            .poll(&job_id, &self.cancellation_token, |attempt, job| {
                self.report(task_id, Stage::Polled {
                    attempt: attempt.attempt,
                    job: job.cloned(),
                });
            })
            .await;

        let outcome = match outcome {
            Err(err) if err.is_cancelled() => PipelineOutcome::Cancelled,
            Err(err) => PipelineOutcome::Failed(err.to_string()),
            Ok(PollOutcome::Failed(job)) => {
                let message = job.error_message.unwrap_or_else(|| "Processing failed.".to_string());
                PipelineOutcome::Failed(message)
            }
            Ok(PollOutcome::Exhausted { attempts, .. }) => PipelineOutcome::TimedOut { attempts },
            Ok(PollOutcome::Completed(job)) => self.finish_completed(&job, file_name, requested_format).await,
        };

        self.report(task_id, Stage::Finished(outcome));
    }

    async fn finish_completed(&self, job: &Job, file_name: &str, requested_format: &str) -> PipelineOutcome {
        let Some(downloader) = &self.downloader else {
            info!(job_id = %job.id, "Processing complete, ready to download");
            return PipelineOutcome::Completed;
        };

        let format = resolve_output_format(job, requested_format);
        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => PipelineOutcome::Cancelled,
            result = downloader.download(&job.id, file_name, format) => match result {
                Ok(path) => PipelineOutcome::Downloaded(path),
                Err(err) => PipelineOutcome::DownloadFailed(err.to_string()),
            },
        }
    }
}
