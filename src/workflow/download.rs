use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use crate::core::{Job, JobApi, JobId, Result, TranscodeError};

/// Replaces the extension of `original` with `format`.
///
/// `photo.heic` + `webp` gives `photo.webp`; a name without extension gets
/// one appended. Directory components of `original` are dropped.
pub fn derive_output_filename(original: &str, format: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(original);
    let format = format.trim().trim_start_matches('.').to_ascii_lowercase();

    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };

    match (stem.is_empty(), format.is_empty()) {
        (true, _) => format!("output.{}", format),
        (false, true) => stem.to_string(),
        (false, false) => format!("{}.{}", stem, format),
    }
}

/// The job's own output format wins over what was asked for at submission
pub fn resolve_output_format<'a>(job: &'a Job, requested: &'a str) -> &'a str {
    job.output_format
        .as_deref()
        .filter(|format| !format.trim().is_empty())
        .unwrap_or(requested)
}

/// 同名文件最多尝试的编号
const MAX_NAME_SUFFIX: u32 = 1000;

/// `photo.webp` -> `photo (n).webp`
fn numbered_file_name(file_name: &str, n: u32) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", file_name, n),
    }
}

/// Fetches processed files and saves them under one directory.
///
/// Existing files are never replaced: a taken name gets a ` (n)` suffix.
#[derive(Clone)]
pub struct Downloader {
    api: Arc<dyn JobApi>,
    dir: PathBuf,
}

impl Downloader {
    pub fn new(api: Arc<dyn JobApi>, dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            dir: dir.into(),
        }
    }

    /// Downloads the result of a COMPLETED job. Failures are not retried.
    pub async fn download(&self, job_id: &JobId, original_name: &str, format: &str) -> Result<PathBuf> {
        if format.trim().trim_start_matches('.').is_empty() {
            return Err(TranscodeError::download(job_id, "no output format known for the job"));
        }
        let file_name = derive_output_filename(original_name, format);

        let result = self.fetch_and_save(job_id, &file_name).await;
        match &result {
            Ok((path, size)) => info!(%job_id, path = %path.display(), size, "Downloaded processed file"),
            Err(err) => error!(%job_id, error = %err, "Download failed"),
        }

        result
            .map(|(path, _)| path)
            .map_err(|err| match err {
                TranscodeError::Download { .. } => err,
                other => TranscodeError::download(job_id, other.to_string()),
            })
    }

    async fn fetch_and_save(&self, job_id: &JobId, file_name: &str) -> Result<(PathBuf, usize)> {
        let payload = self.api.download(job_id).await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let (path, mut file) = self.create_unique(file_name).await?;
        file.write_all(&payload).await?;
        file.flush().await?;

        Ok((path, payload.len()))
    }

    /// create_new makes the claim atomic between concurrent downloads
    async fn create_unique(&self, file_name: &str) -> Result<(PathBuf, tokio::fs::File)> {
        for n in 0..=MAX_NAME_SUFFIX {
            let candidate = match n {
                0 => file_name.to_string(),
                n => numbered_file_name(file_name, n),
            };
            let path = self.dir.join(&candidate);

            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "File exists, trying next name");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(TranscodeError::internal_error(format!("No free file name for {}", file_name)))
    }
}
