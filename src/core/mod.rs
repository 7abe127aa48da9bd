mod errors;
mod settings;
mod traits;
mod types;

pub use errors::{Result, TranscodeError};
pub use settings::{OutputFormat, ProcessingSettings, ProcessingSettingsBuilder, Quality, Resize};
pub use traits::{JobApi, StateStore};
pub use types::{
    ActivityStatus,
    HealthStatus,
    Job,
    JobEvent,
    JobId,
    JobPhase,
    JobQuery,
    JobStatus,
    ManagerCommand,
    PollAttempt,
    PollOutcome,
    ProcessingJob,
    ProcessingJobsResponse,
    RecentActivity,
    StatsResponse,
    SystemStats,
    TaskId,
    TrackedJob,
    UploadResponse,
    UploadTask,
};
pub(crate) use types::QueuedJobsBody;
