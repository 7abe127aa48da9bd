use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Upload of {} failed: {source}", file.display())]
    Upload {
        file: PathBuf,
        #[source]
        source: Box<TranscodeError>,
    },

    #[error("Download of job {job_id} failed: {message}")]
    Download {
        job_id: String,
        message: String,
    },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Unknown job status: {0}")]
    InvalidStatus(String),

    #[error("Unknown view: {0}")]
    InvalidView(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task not found")]
    TaskNotFound,

    #[error("Job {0} is already being polled")]
    AlreadyPolling(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Manager shut down")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TranscodeError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn upload(file: impl Into<PathBuf>, source: TranscodeError) -> Self {
        Self::Upload {
            file: file.into(),
            source: Box::new(source),
        }
    }

    pub fn download(job_id: impl ToString, message: impl Into<String>) -> Self {
        Self::Download {
            job_id: job_id.to_string(),
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Cancellation is not a failure of the job itself
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Upload { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Error alias
pub type Result<T, E = TranscodeError> = std::result::Result<T, E>;
