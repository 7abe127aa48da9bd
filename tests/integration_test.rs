use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use transcode::core::{
    HealthStatus,
    Job,
    JobApi,
    JobEvent,
    JobId,
    JobPhase,
    JobQuery,
    JobStatus,
    PollOutcome,
    ProcessingJobsResponse,
    ProcessingSettings,
    StatsResponse,
    SystemStats,
    TaskId,
    TranscodeError,
    UploadResponse,
    UploadTask,
};
use transcode::workflow::{JobManager, JobPoller, PollConfig, WorkflowConfig};

/// 一次状态查询的脚本结果
#[derive(Clone)]
enum Step {
    Status(JobStatus),
    Error,
}

/// 模拟服务端 - 按脚本返回每次查询的结果
#[derive(Default)]
struct ScriptedApi {
    /// 脚本用完后重复最后一步
    scripts: Mutex<HashMap<JobId, VecDeque<Step>>>,
    queries: Mutex<HashMap<JobId, Vec<Instant>>>,
    output_formats: Mutex<HashMap<JobId, String>>,
    /// 这些 job 的下载返回错误
    broken_downloads: Mutex<HashSet<JobId>>,
    downloads: Mutex<HashMap<JobId, usize>>,
}

impl ScriptedApi {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, job_id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(JobId::from(job_id), steps.into());
        self
    }

    fn output_format(self, job_id: &str, format: &str) -> Self {
        self.output_formats
            .lock()
            .unwrap()
            .insert(JobId::from(job_id), format.to_string());
        self
    }

    fn fail_download(self, job_id: &str) -> Self {
        self.broken_downloads
            .lock()
            .unwrap()
            .insert(JobId::from(job_id));
        self
    }

    fn download_count(&self, job_id: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .get(&JobId::from(job_id))
            .copied()
            .unwrap_or_default()
    }

    fn query_times(&self, job_id: &str) -> Vec<Instant> {
        self.queries
            .lock()
            .unwrap()
            .get(&JobId::from(job_id))
            .cloned()
            .unwrap_or_default()
    }

    fn query_count(&self, job_id: &str) -> usize {
        self.query_times(job_id).len()
    }

    fn next_step(&self, job_id: &JobId) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts.entry(job_id.clone()).or_default();
        match steps.len() {
            0 => Step::Status(JobStatus::Processing),
            1 => steps[0].clone(),
            _ => steps.pop_front().unwrap(),
        }
    }
}

fn job(job_id: &JobId, status: JobStatus, output_format: Option<String>) -> Job {
    Job {
        id: job_id.clone(),
        original_filename: None,
        status,
        output_format,
        output_quality: None,
        file_size: None,
        progress: None,
        error_message: (status == JobStatus::Failed).then(|| "codec exploded".to_string()),
        created_at: None,
        updated_at: None,
        completed_at: None,
    }
}

#[async_trait::async_trait]
impl JobApi for ScriptedApi {
    async fn upload(&self, task: &UploadTask, progress_tx: Option<UnboundedSender<u64>>) -> transcode::Result<UploadResponse> {
        if task.file_name.starts_with("broken") {
            return Err(TranscodeError::server_error(500, "Failed to upload file"));
        }

        if let Some(progress_tx) = progress_tx {
            let _ = progress_tx.send(task.file_size / 2);
            let _ = progress_tx.send(task.file_size);
        }

        Ok(UploadResponse {
            id: JobId::new(format!("job-{}", task.file_name)),
            filename: Some(task.file_name.clone()),
            status: JobStatus::Queued,
            progress: None,
            file_size: Some(task.file_size),
            message: None,
        })
    }

    async fn get_job(&self, job_id: &JobId) -> transcode::Result<Job> {
        self.queries
            .lock()
            .unwrap()
            .entry(job_id.clone())
            .or_default()
            .push(Instant::now());

        match self.next_step(job_id) {
            Step::Status(status) => {
                let format = self.output_formats.lock().unwrap().get(job_id).cloned();
                Ok(job(job_id, status, format))
            }
            Step::Error => Err(TranscodeError::server_error(502, "Bad Gateway")),
        }
    }

    async fn download(&self, job_id: &JobId) -> transcode::Result<Bytes> {
        *self.downloads.lock().unwrap().entry(job_id.clone()).or_default() += 1;

        if self.broken_downloads.lock().unwrap().contains(job_id) {
            return Err(TranscodeError::server_error(500, "Storage unavailable"));
        }
        Ok(Bytes::from(format!("converted {}", job_id)))
    }

    async fn queued_jobs(&self) -> transcode::Result<ProcessingJobsResponse> {
        Ok(ProcessingJobsResponse { jobs: Vec::new(), total: 0, page: 0, size: 0 })
    }

    async fn jobs_by_status(&self, _status: JobStatus) -> transcode::Result<Vec<Job>> {
        Ok(Vec::new())
    }

    async fn list_jobs(&self, _query: &JobQuery) -> transcode::Result<Vec<Job>> {
        Ok(Vec::new())
    }

    async fn delete_job(&self, _job_id: &JobId) -> transcode::Result<()> {
        Ok(())
    }

    async fn system_stats(&self) -> transcode::Result<SystemStats> {
        Ok(SystemStats::default())
    }

    async fn stats(&self) -> transcode::Result<StatsResponse> {
        Ok(StatsResponse::default())
    }

    async fn health(&self) -> transcode::Result<HealthStatus> {
        Ok(HealthStatus { status: "UP".to_string(), service: None, timestamp: None })
    }
}

fn task(file_name: &str, format: &str) -> UploadTask {
    UploadTask {
        id: TaskId::new(),
        file_path: PathBuf::from(file_name),
        file_name: file_name.to_string(),
        file_size: 1024,
        settings: ProcessingSettings::builder(format).build().unwrap(),
    }
}

async fn poll(api: Arc<ScriptedApi>, job_id: &str, config: PollConfig) -> transcode::Result<PollOutcome> {
    let poller = JobPoller::new(api, config);
    poller
        .poll(&JobId::from(job_id), &CancellationToken::new(), |_, _| {})
        .await
}

#[tokio::test(start_paused = true)]
async fn test_completed_on_first_query() {
    let api = Arc::new(ScriptedApi::new().script("a", vec![Step::Status(JobStatus::Completed)]));

    let outcome = poll(api.clone(), "a", PollConfig::default()).await.unwrap();

    assert!(matches!(outcome, PollOutcome::Completed(job) if job.status == JobStatus::Completed));
    assert_eq!(api.query_count("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_never_terminal_stops_after_budget() {
    let api = Arc::new(ScriptedApi::new().script("slow", vec![Step::Status(JobStatus::Processing)]));
    let started = Instant::now();

    let outcome = poll(api.clone(), "slow", PollConfig::default()).await.unwrap();

    assert_eq!(outcome, PollOutcome::Exhausted {
        attempts: 60,
        last_status: Some(JobStatus::Processing),
    });

    let times = api.query_times("slow");
    assert_eq!(times.len(), 60);
    for pair in times.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
    }
    // 最后一次查询之后不再等待
    assert_eq!(started.elapsed(), Duration::from_secs(2 * 59));
}

#[tokio::test(start_paused = true)]
async fn test_failed_stops_polling() {
    let api = Arc::new(ScriptedApi::new().script("bad", vec![
        Step::Status(JobStatus::Queued),
        Step::Status(JobStatus::Processing),
        Step::Status(JobStatus::Failed),
    ]));

    let outcome = poll(api.clone(), "bad", PollConfig::new(10, Duration::from_secs(2))).await.unwrap();

    match outcome {
        PollOutcome::Failed(job) => assert_eq!(job.error_message.as_deref(), Some("codec exploded")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(api.query_count("bad"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_uses_an_attempt() {
    let api = Arc::new(ScriptedApi::new()
        .script("flaky", vec![Step::Error, Step::Error, Step::Status(JobStatus::Completed)])
        .script("down", vec![Step::Error]));

    let outcome = poll(api.clone(), "flaky", PollConfig::new(3, Duration::from_secs(2))).await.unwrap();
    assert!(matches!(outcome, PollOutcome::Completed(_)));
    assert_eq!(api.query_count("flaky"), 3);

    let outcome = poll(api.clone(), "down", PollConfig::new(2, Duration::from_secs(2))).await.unwrap();
    assert_eq!(outcome, PollOutcome::Exhausted { attempts: 2, last_status: None });
    assert_eq!(api.query_count("down"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_poll_loop() {
    let api = Arc::new(ScriptedApi::new());
    let poller = JobPoller::new(api.clone(), PollConfig::new(60, Duration::from_secs(2)));
    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            token.cancel();
        }
    });

    let mut seen = 0;
    let result = poller.poll(&JobId::from("x"), &token, |_, _| seen += 1).await;

    assert!(matches!(result, Err(TranscodeError::Cancelled)));
    assert_eq!(seen, 2);
    assert_eq!(api.query_count("x"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_upload_failure_does_not_block_other_files() {
    let api = Arc::new(ScriptedApi::new().script("job-ok.mp4", vec![
        Step::Status(JobStatus::Processing),
        Step::Status(JobStatus::Completed),
    ]));
    let config = WorkflowConfig {
        poll: PollConfig::new(10, Duration::from_secs(2)),
        download_dir: None,
    };

    let handle = JobManager::new(api.clone(), config);
    let mut events = handle.manager.subscribe_events();

    let broken = task("broken.mp4", "mp4");
    let ok = task("ok.mp4", "mp4");
    let ids = handle.manager.submit_batch(vec![broken.clone(), ok.clone()]).await.unwrap();
    assert_eq!(ids, vec![broken.id, ok.id]);

    let jobs = handle.manager.wait_all().await.unwrap();
    let phase = |id: TaskId| jobs.iter().find(|job| job.id == id).map(|job| job.phase);

    assert_eq!(phase(broken.id), Some(JobPhase::UploadFailed));
    assert_eq!(phase(ok.id), Some(JobPhase::Completed));
    assert_eq!(api.query_count("job-ok.mp4"), 2);

    let mut upload_failed = false;
    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            JobEvent::UploadFailed { task_id, .. } => upload_failed |= task_id == broken.id,
            JobEvent::Completed { task_id, job_id } => {
                completed |= task_id == ok.id && job_id.as_str() == "job-ok.mp4";
            }
            _ => {}
        }
    }
    assert!(upload_failed);
    assert!(completed);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_job_is_reported() {
    let api = Arc::new(ScriptedApi::new());
    let config = WorkflowConfig {
        poll: PollConfig::new(3, Duration::from_secs(2)),
        download_dir: None,
    };
    let handle = JobManager::new(api.clone(), config);

    let task_id = handle.manager.submit(task("long.mkv", "mp4")).await.unwrap();
    let jobs = handle.manager.wait_all().await.unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, task_id);
    assert_eq!(jobs[0].phase, JobPhase::TimedOut);
    assert_eq!(jobs[0].attempts, 3);
    assert_eq!(jobs[0].last_status, Some(JobStatus::Processing));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_watch_rejected() {
    let api = Arc::new(ScriptedApi::new());
    let handle = JobManager::new(api.clone(), WorkflowConfig::default());

    let first = handle.manager.watch(JobId::from("job-1"), "clip.mov", None).await.unwrap();
    let second = handle.manager.watch(JobId::from("job-1"), "clip.mov", None).await;
    assert!(matches!(second, Err(TranscodeError::AlreadyPolling(id)) if id == "job-1"));

    assert_eq!(handle.manager.cancel_all().await.unwrap(), 1);
    let jobs = handle.manager.wait_all().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, first);
    assert_eq!(jobs[0].phase, JobPhase::Cancelled);

    // 上一个循环结束后可以重新跟踪
    handle.manager.watch(JobId::from("job-1"), "clip.mov", None).await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_refuses_new_work() {
    let handle = JobManager::new(Arc::new(ScriptedApi::new()), WorkflowConfig::default());

    handle.manager.shutdown();
    let result = handle.manager.submit(task("late.png", "jpg")).await;
    assert!(matches!(result, Err(TranscodeError::ManagerShutdown)));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completed_job_is_downloaded() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::new()
        .script("job-photo.heic", vec![Step::Status(JobStatus::Completed)])
        .script("job-clip.avi", vec![Step::Status(JobStatus::Completed)])
        .output_format("job-clip.avi", "MP4"));
    let config = WorkflowConfig {
        poll: PollConfig::new(5, Duration::from_millis(10)),
        download_dir: Some(dir.path().to_path_buf()),
    };
    let handle = JobManager::new(api.clone(), config);

    let photo = handle.manager.submit(task("photo.heic", "webp")).await.unwrap();
    let clip = handle.manager.submit(task("clip.avi", "webm")).await.unwrap();
    handle.manager.wait_all().await.unwrap();

    let photo = handle.manager.get_task(photo).await.unwrap().unwrap();
    assert_eq!(photo.phase, JobPhase::Downloaded);
    assert_eq!(photo.output_path, Some(dir.path().join("photo.webp")));
    let contents = std::fs::read_to_string(dir.path().join("photo.webp")).unwrap();
    assert_eq!(contents, "converted job-photo.heic");

    // 服务端返回的格式优先
    let clip = handle.manager.get_task(clip).await.unwrap().unwrap();
    assert_eq!(clip.output_path, Some(dir.path().join("clip.mp4")));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_stem_downloads_keep_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::new()
        .script("job-photo.heic", vec![Step::Status(JobStatus::Completed)])
        .script("job-photo.png", vec![Step::Status(JobStatus::Completed)]));
    let config = WorkflowConfig {
        poll: PollConfig::new(5, Duration::from_millis(10)),
        download_dir: Some(dir.path().to_path_buf()),
    };
    let handle = JobManager::new(api.clone(), config);

    let heic = task("photo.heic", "webp");
    let png = task("photo.png", "webp");
    handle.manager.submit_batch(vec![heic.clone(), png.clone()]).await.unwrap();
    let jobs = handle.manager.wait_all().await.unwrap();

    let mut paths: Vec<PathBuf> = jobs
        .iter()
        .inspect(|job| assert_eq!(job.phase, JobPhase::Downloaded))
        .filter_map(|job| job.output_path.clone())
        .collect();
    paths.sort();
    assert_eq!(paths, vec![dir.path().join("photo (1).webp"), dir.path().join("photo.webp")]);

    let mut contents: Vec<String> = paths
        .iter()
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["converted job-photo.heic", "converted job-photo.png"]);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_download_failure_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::new()
        .script("job-bad.png", vec![Step::Status(JobStatus::Completed)])
        .script("job-good.png", vec![Step::Status(JobStatus::Completed)])
        .fail_download("job-bad.png"));
    let config = WorkflowConfig {
        poll: PollConfig::new(5, Duration::from_millis(10)),
        download_dir: Some(dir.path().to_path_buf()),
    };
    let handle = JobManager::new(api.clone(), config);
    let mut events = handle.manager.subscribe_events();

    let bad = task("bad.png", "jpg");
    let good = task("good.png", "jpg");
    handle.manager.submit_batch(vec![bad.clone(), good.clone()]).await.unwrap();
    handle.manager.wait_all().await.unwrap();

    let bad_job = handle.manager.get_task(bad.id).await.unwrap().unwrap();
    assert_eq!(bad_job.phase, JobPhase::DownloadFailed);
    assert!(bad_job.output_path.is_none());
    let error = bad_job.error.unwrap();
    assert!(error.contains("job-bad.png"), "{}", error);
    assert!(error.contains("Storage unavailable"), "{}", error);
    assert_eq!(api.download_count("job-bad.png"), 1);

    let good_job = handle.manager.get_task(good.id).await.unwrap().unwrap();
    assert_eq!(good_job.phase, JobPhase::Downloaded);
    assert_eq!(good_job.output_path, Some(dir.path().join("good.jpg")));
    assert!(!dir.path().join("bad.jpg").exists());

    let mut reported = 0;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::DownloadFailed { task_id, job_id, .. } = event {
            assert_eq!(task_id, bad.id);
            assert_eq!(job_id.as_str(), "job-bad.png");
            reported += 1;
        }
    }
    assert_eq!(reported, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watch_without_format_does_not_save() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::new().script("job-9", vec![Step::Status(JobStatus::Completed)]));
    let config = WorkflowConfig {
        poll: PollConfig::new(5, Duration::from_millis(10)),
        download_dir: Some(dir.path().to_path_buf()),
    };
    let handle = JobManager::new(api.clone(), config);

    let task_id = handle.manager.watch(JobId::from("job-9"), "clip.mov", None).await.unwrap();
    handle.manager.wait_all().await.unwrap();

    let job = handle.manager.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(job.phase, JobPhase::DownloadFailed);
    assert!(job.output_path.is_none());
    assert_eq!(api.download_count("job-9"), 0);
    assert_eq!(std::fs::read_dir(dir.path()).map(|entries| entries.count()).unwrap_or(0), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_event_stream_drains_then_closes_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(ScriptedApi::new().script("job-song.wav", vec![Step::Status(JobStatus::Completed)]));
    let config = WorkflowConfig {
        poll: PollConfig::new(5, Duration::from_millis(10)),
        download_dir: Some(dir.path().to_path_buf()),
    };
    let handle = JobManager::new(api, config);
    let mut events = handle.manager.subscribe_events();

    handle.manager.submit(task("song.wav", "mp3")).await.unwrap();
    handle.manager.wait_all().await.unwrap();
    handle.shutdown().await.unwrap();

    // 关闭之后仍能读到最后的事件，然后通道关闭
    let mut saved = None;
    loop {
        match events.recv().await {
            Ok(JobEvent::Downloaded { path, .. }) => saved = Some(path),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    assert_eq!(saved, Some(dir.path().join("song.mp3")));
}
