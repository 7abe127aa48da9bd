use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::core::{Job, JobApi, JobId, JobStatus, PollAttempt, PollOutcome, Result, TranscodeError};

/// 默认最大轮询次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// 轮询配置
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// 最大查询次数（包含第一次）
    pub max_attempts: u32,
    /// 两次查询之间的固定等待
    pub interval: Duration,
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL)
    }
}

/// Bounded status polling for a single job.
///
/// Queries are strictly sequential: the next one is only issued after the
/// previous returned and the delay elapsed. A transport error on one query
/// uses up that attempt but never ends the loop; only a terminal status,
/// budget exhaustion or cancellation does.
pub struct JobPoller {
    api: Arc<dyn JobApi>,
    config: PollConfig,
}

impl JobPoller {
    pub fn new(api: Arc<dyn JobApi>, config: PollConfig) -> Self {
        Self { api, config }
    }

    /// Polls `job_id` until it is COMPLETED or FAILED or the budget runs out.
    ///
    /// `on_attempt` sees every query, with the job when the query succeeded.
    /// Returns [`TranscodeError::Cancelled`] as soon as the token fires.
    pub async fn poll<F>(
        &self,
        job_id: &JobId,
        cancellation_token: &CancellationToken,
        mut on_attempt: F,
    ) -> Result<PollOutcome>
    where
        F: FnMut(&PollAttempt, Option<&Job>),
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts;
        let mut last_status: Option<JobStatus> = None;

        for attempt in 1..=max_attempts {
            let poll_attempt = PollAttempt {
                job_id: job_id.clone(),
                attempt,
                elapsed: started.elapsed(),
            };

            let result = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => return Err(TranscodeError::Cancelled),
                result = self.api.get_job(job_id) => result,
            };

            match result {
                Ok(job) => {
                    debug!(%job_id, attempt, status = %job.status, "Polled job status");
                    on_attempt(&poll_attempt, Some(&job));
                    last_status = Some(job.status);

                    match job.status {
                        JobStatus::Completed => return Ok(PollOutcome::Completed(job)),
                        JobStatus::Failed => return Ok(PollOutcome::Failed(job)),
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!(%job_id, attempt, error = %err, "Error polling job status");
                    on_attempt(&poll_attempt, None);
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancellation_token.cancelled() => return Err(TranscodeError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
        }

        warn!(%job_id, attempts = max_attempts, "Gave up polling job before it reached a terminal status");

        Ok(PollOutcome::Exhausted {
            attempts: max_attempts,
            last_status,
        })
    }
}
