mod download;
mod manager;
mod manager_worker;
mod pipeline;
mod poller;
mod submit;

pub use download::{Downloader, derive_output_filename, resolve_output_format};
pub use manager::{JobManager, JobManagerHandle, WorkflowConfig};
pub use poller::{DEFAULT_MAX_ATTEMPTS, JobPoller, PollConfig};
pub use submit::submit;
