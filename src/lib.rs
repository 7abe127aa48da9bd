pub mod api;
pub mod config;
pub mod core;
pub mod state;
pub mod utils;
pub mod workflow;

// 重新导出核心类型
pub use core::{
    Job,
    JobApi,
    JobEvent,
    JobId,
    JobPhase,
    JobStatus,
    ProcessingSettings,
    Quality,
    Result,
    TaskId,
    TrackedJob,
    TranscodeError,
    UploadTask,
};

pub use api::HttpJobClient;
pub use config::Config;
pub use state::{ActiveView, AppState, FileStateStore, MemoryStateStore};
pub use workflow::{JobManager, JobManagerHandle, JobPoller, PollConfig, WorkflowConfig};
