use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transcode::core::{Job, JobEvent, JobPhase, JobQuery, JobStatus, ProcessingSettings, Quality, TaskId, TrackedJob, UploadTask};
use transcode::state::{ActiveView, AppState, FileStateStore};
use transcode::utils::{format_bytes, format_duration, percentage};
use transcode::workflow::{Downloader, JobManager, JobManagerHandle, resolve_output_format};
use transcode::{Config, HttpJobClient, JobApi, JobId};

#[derive(Parser)]
#[command(name = "transcode")]
#[command(about = "Submit media files for transcoding and fetch the results")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file
    #[arg(long, global = true, default_value = transcode::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// API base url, overrides the config file
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Status queries per job
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Wait between status queries
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files and follow them until processed
    Submit(SubmitArgs),
    /// Show one job
    Status {
        job_id: String,
    },
    /// Follow an already submitted job
    Watch {
        job_id: String,
        /// Original file name, used for the downloaded file
        #[arg(long)]
        name: String,
        #[arg(long)]
        format: Option<String>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Download the result of a completed job
    Download {
        job_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// List queued jobs
    Queue,
    /// List jobs, optionally by status
    Jobs {
        /// queued, processing, completed or failed
        #[arg(long)]
        status: Option<JobStatus>,
        /// Page through all jobs instead of asking for one status
        #[arg(long)]
        page: Option<u32>,
        #[arg(long, default_value_t = 10)]
        size: u32,
    },
    /// Delete a job
    Delete {
        job_id: String,
    },
    /// Server dashboard metrics
    Stats,
    /// Check that the API is up
    Health,
    /// Show or switch the active view
    View {
        name: Option<ActiveView>,
    },
}

#[derive(Args)]
struct SubmitArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Defaults come from this view, the last used view otherwise
    #[arg(long)]
    view: Option<ActiveView>,

    #[arg(long)]
    quality: Option<Quality>,

    #[arg(long)]
    format: Option<String>,

    #[arg(long)]
    add_subtitles: bool,

    #[arg(long)]
    extract_metadata: bool,

    #[arg(long)]
    optimize_web: bool,

    #[arg(long)]
    optimize_mobile: bool,

    #[arg(long, requires = "height")]
    width: Option<u32>,

    #[arg(long, requires = "width")]
    height: Option<u32>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct OutputArgs {
    /// Where processed files are saved
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Only poll, leave the result on the server
    #[arg(long)]
    no_download: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "transcode=debug" } else { "transcode=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(endpoint) = cli.endpoint {
        config.api.endpoint = endpoint;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.poll.max_attempts = max_attempts;
    }
    if let Some(interval_ms) = cli.interval_ms {
        config.poll.interval_ms = interval_ms;
    }
    config.validate()?;

    let client = HttpJobClient::new(&config.api.endpoint, config.timeout())?;
    let api: Arc<dyn JobApi> = Arc::new(client);

    match cli.command {
        Commands::Submit(args) => submit(api, config, args).await,
        Commands::Status { job_id } => {
            let job = api.get_job(&JobId::new(job_id)).await?;
            println!("Job:      {}", job.id);
            println!("File:     {}", job.original_filename.as_deref().unwrap_or("-"));
            println!("Status:   {}", job.status);
            if let Some(progress) = job.progress {
                println!("Progress: {:.0}%", progress);
            }
            if let Some(format) = &job.output_format {
                println!("Format:   {}", format);
            }
            if let Some(size) = job.file_size {
                println!("Size:     {}", format_bytes(size));
            }
            if let Some(error) = &job.error_message {
                println!("Error:    {}", error);
            }
            Ok(())
        }
        Commands::Watch { job_id, name, format, output } => {
            apply_output(&mut config, &output);
            let handle = JobManager::new(api, config.workflow_config());
            let events = handle.manager.subscribe_events();
            handle.manager.watch(JobId::new(job_id), name, format).await?;
            let jobs = run_to_completion(handle, events).await?;
            print_summary(&jobs);
            Ok(())
        }
        Commands::Download { job_id, name, format, output_dir } => {
            let job_id = JobId::new(job_id);
            let format = match format {
                Some(format) => format,
                None => {
                    let job = api.get_job(&job_id).await?;
                    let format = resolve_output_format(&job, "");
                    if format.is_empty() {
                        bail!("Job {} has no output format, pass --format", job_id);
                    }
                    format.to_string()
                }
            };

            let dir = output_dir.unwrap_or(config.download.dir);
            let path = Downloader::new(api, dir).download(&job_id, &name, &format).await?;
            println!("Saved {}", path.display());
            Ok(())
        }
        Commands::Queue => {
            let queue = api.queued_jobs().await?;
            if queue.jobs.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }

            println!("{} job(s) queued", queue.total);
            for job in queue.jobs {
                println!(
                    "  {}  {:<10} {:>4.0}%  {:>10}  {}",
                    job.id,
                    job.status.to_string(),
                    job.progress.unwrap_or_default(),
                    job.file_size.map(format_bytes).unwrap_or_default(),
                    job.file_name.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        Commands::Delete { job_id } => {
            let job_id = JobId::new(job_id);
            api.delete_job(&job_id).await?;
            println!("Deleted {}", job_id);
            Ok(())
        }
        Commands::Jobs { status, page, size } => {
            let jobs = match (status, page) {
                (Some(status), None) => api.jobs_by_status(status).await?,
                (status, page) => {
                    let query = JobQuery { status, page: page.unwrap_or_default(), size };
                    api.list_jobs(&query).await?
                }
            };

            if jobs.is_empty() {
                println!("No jobs");
                return Ok(());
            }
            for job in &jobs {
                print_job_line(job);
            }
            Ok(())
        }
        Commands::Health => {
            let health = api.health().await?;
            let service = health.service.as_deref().unwrap_or("api");
            println!("{} at {}: {}", service, config.api.endpoint, health.status);
            if !health.is_up() {
                bail!("{} is not healthy", service);
            }
            Ok(())
        }
        Commands::Stats => {
            let totals = api.stats().await?;
            println!("Jobs:              {} total, {} queued, {} processing, {} completed, {} failed",
                totals.total_jobs,
                totals.queued_jobs,
                totals.processing_jobs,
                totals.completed_jobs,
                totals.failed_jobs,
            );
            println!("Data processed:    {}", totals.total_data_processed);
            println!("Avg compression:   {:.2}", totals.average_compression_ratio);

            let stats = api.system_stats().await?;
            println!("Files processed:   {}", stats.total_files_processed);
            println!("Files in queue:    {}", stats.files_in_queue);
            println!("Active users:      {}", stats.active_users);
            println!("Success rate:      {:.1}%", stats.success_rate);
            println!("Avg processing:    {:.1}s", stats.avg_processing_time);
            println!("Storage used:      {}", format_bytes(stats.storage_used));
            println!("CPU / memory:      {:.1}% / {:.1}%", stats.cpu_usage, stats.memory_usage);
            println!("Uptime:            {}", format_duration(Duration::from_secs(stats.uptime)));
            for activity in stats.recent_activity {
                println!("  [{}] {} {}", activity.time, activity.kind, activity.message);
            }
            Ok(())
        }
        Commands::View { name } => {
            let mut state = AppState::load(FileStateStore::new(&config.state_file));
            if let Some(view) = name {
                state.set_active_view(view)?;
            }
            println!("{}", state.active_view());
            Ok(())
        }
    }
}

fn apply_output(config: &mut Config, output: &OutputArgs) {
    if let Some(dir) = &output.output_dir {
        config.download.dir = dir.clone();
    }
    if output.no_download {
        config.download.auto = false;
    }
}

fn build_settings(view: ActiveView, args: &SubmitArgs) -> Result<ProcessingSettings> {
    let defaults = view
        .default_settings()
        .or_else(|| {
            warn!(%view, "View has no upload defaults, using pictures");
            ActiveView::Pictures.default_settings()
        })
        .context("No default processing settings")?;

    let format = args.format.as_deref().unwrap_or(defaults.format().as_str());
    let mut builder = ProcessingSettings::builder(format)
        .quality(args.quality.unwrap_or(defaults.quality()))
        .add_subtitles(args.add_subtitles || defaults.add_subtitles())
        .extract_metadata(args.extract_metadata || defaults.extract_metadata())
        .optimize_for_web(args.optimize_web || defaults.optimize_for_web())
        .optimize_for_mobile(args.optimize_mobile || defaults.optimize_for_mobile());

    if let (Some(width), Some(height)) = (args.width, args.height) {
        builder = builder.resize(width, height);
    }

    Ok(builder.build()?)
}

async fn submit(api: Arc<dyn JobApi>, mut config: Config, args: SubmitArgs) -> Result<()> {
    apply_output(&mut config, &args.output);

    let mut state = AppState::load(FileStateStore::new(&config.state_file));
    let view = match args.view {
        Some(view) => {
            if let Err(err) = state.set_active_view(view) {
                warn!(error = %err, "Failed to save view");
            }
            view
        }
        None => state.active_view(),
    };
    let settings = build_settings(view, &args)?;

    // 无法读取的文件单独报错，其余文件照常提交
    let mut tasks = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match UploadTask::from_path(path, settings.clone()).await {
            Ok(task) => tasks.push(task),
            Err(err) => eprintln!("Skipping {}: {}", path.display(), err),
        }
    }
    if tasks.is_empty() {
        bail!("No files to upload");
    }

    let total_bytes: u64 = tasks.iter().map(|task| task.file_size).sum();
    info!(files = tasks.len(), size = %format_bytes(total_bytes), %view, format = %settings.format(), "Submitting");

    let handle = JobManager::new(api, config.workflow_config());
    let events = handle.manager.subscribe_events();
    handle.manager.submit_batch(tasks).await?;
    let jobs = run_to_completion(handle, events).await?;

    print_summary(&jobs);
    Ok(())
}

/// Prints events until every pipeline finished; ctrl-c cancels the rest
async fn run_to_completion(handle: JobManagerHandle, events: broadcast::Receiver<JobEvent>) -> Result<Vec<TrackedJob>> {
    let printer = tokio::spawn(print_events(events));

    let ctrl_c = tokio::spawn({
        let manager = handle.manager.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                manager.shutdown();
            }
        }
    });

    let jobs = handle.manager.wait_all().await;

    // 事件通道在所有 manager 句柄和 worker 都释放后才关闭
    ctrl_c.abort();
    let _ = ctrl_c.await;
    handle.shutdown().await?;
    let _ = printer.await;

    Ok(jobs?)
}

async fn print_events(mut events: broadcast::Receiver<JobEvent>) {
    let mut names: HashMap<TaskId, String> = HashMap::new();
    let mut last_decile: HashMap<TaskId, u64> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            JobEvent::Submitted { task_id, job_id } => {
                names.insert(task_id, job_id.to_string());
                println!("Submitted as job {}", job_id);
            }
            JobEvent::UploadProgress { task_id, bytes_sent, total_bytes } => {
                let decile = (percentage(bytes_sent, total_bytes) / 10.0) as u64;
                if last_decile.insert(task_id, decile) != Some(decile) {
                    println!("Uploading {} / {}", format_bytes(bytes_sent), format_bytes(total_bytes));
                }
            }
            JobEvent::UploadFailed { error, .. } => println!("Upload failed: {}", error),
            JobEvent::StatusChanged { job_id, new_status, .. } => println!("Job {}: {}", job_id, new_status),
            JobEvent::PollExhausted { job_id, attempts, .. } => {
                println!("Job {} still running after {} checks, try `transcode watch` later", job_id, attempts);
            }
            JobEvent::Completed { job_id, .. } => println!("Job {} complete", job_id),
            JobEvent::Failed { job_id, error, .. } => println!("Job {} failed: {}", job_id, error),
            JobEvent::Downloaded { path, .. } => println!("Saved {}", path.display()),
            JobEvent::DownloadFailed { job_id, error, .. } => println!("Download of {} failed: {}", job_id, error),
            JobEvent::Cancelled { task_id } => {
                let name = names.get(&task_id).map(String::as_str).unwrap_or("upload");
                println!("Cancelled {}", name);
            }
        }
    }
}

fn print_job_line(job: &Job) {
    println!(
        "  {}  {:<10} {:>4.0}%  {:>6}  {}",
        job.id,
        job.status.to_string(),
        job.progress.unwrap_or_default(),
        job.output_format.as_deref().unwrap_or("-"),
        job.original_filename.as_deref().unwrap_or("-"),
    );
}

fn print_summary(jobs: &[TrackedJob]) {
    println!();
    for job in jobs {
        let elapsed = job.finished_at
            .and_then(|finished| (finished - job.created_at).to_std().ok())
            .map(format_duration)
            .unwrap_or_default();
        let detail = match job.phase {
            JobPhase::Downloaded => job.output_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            _ => job.error.clone().unwrap_or_default(),
        };

        println!("{:<32} {:<15} {:>8}  {}", job.file_name, format!("{:?}", job.phase), elapsed, detail);
    }
}
