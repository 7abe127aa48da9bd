use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};
use crate::core::{JobApi, Result, TranscodeError, UploadResponse, UploadTask};

/// Uploads one file with its settings snapshot.
///
/// Any failure is wrapped in [`TranscodeError::Upload`] naming the file, so
/// callers handling many files can report it against that file alone.
pub async fn submit(
    api: &dyn JobApi,
    task: &UploadTask,
    progress_tx: Option<UnboundedSender<u64>>,
) -> Result<UploadResponse> {
    info!(
        file = %task.file_name,
        format = %task.settings.format(),
        quality = %task.settings.quality(),
        "Submitting file"
    );

    match api.upload(task, progress_tx).await {
        Ok(response) => {
            info!(file = %task.file_name, job_id = %response.id, status = %response.status, "Job created");
            Ok(response)
        }
        Err(err) => {
            error!(file = %task.file_name, error = %err, "Upload failed");
            Err(TranscodeError::upload(&task.file_path, err))
        }
    }
}
