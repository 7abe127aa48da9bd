//! config.toml 配置

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::core::{Result, TranscodeError};
use crate::workflow::{DEFAULT_MAX_ATTEMPTS, PollConfig, WorkflowConfig};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// 视图状态文件
    pub state_file: PathBuf,
    pub api: ApiConfig,
    pub poll: PollSettings,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    /// 单个请求超时，上传大文件时需要足够长
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub dir: PathBuf,
    /// 处理完成后自动下载
    pub auto: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".transcode-state.json"),
            api: ApiConfig::default(),
            poll: PollSettings::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api".to_string(),
            timeout_secs: 300,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_ms: 2000,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("downloads"),
            auto: true,
        }
    }
}

impl Config {
    /// Reads `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.max_attempts == 0 {
            return Err(TranscodeError::Config("poll.max_attempts must be at least 1".to_string()));
        }
        if self.api.timeout_secs == 0 {
            return Err(TranscodeError::Config("api.timeout_secs must be at least 1".to_string()));
        }
        if self.api.endpoint.trim().is_empty() {
            return Err(TranscodeError::Config("api.endpoint is empty".to_string()));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::new(self.poll.max_attempts, Duration::from_millis(self.poll.interval_ms))
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            poll: self.poll_config(),
            download_dir: self.download.auto.then(|| self.download.dir.clone()),
        }
    }
}
