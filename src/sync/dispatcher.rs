// Outbound actions: text messages and file uploads
// Nothing here touches the live stream; accepted messages come back as stream echoes

use futures::future::join_all;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ClientError, RequestFailure};
use crate::sync::http::ChatApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the server. The id is informational only.
    Sent { message_id: Option<String> },
    /// Input was blank after trimming; no request was made
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_name: String,
    /// Server-side storage name, used later as the download token
    pub stored_as: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    api: Arc<dyn ChatApi>,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    pub async fn send_text(&self, input: &str) -> Result<SendOutcome, ClientError> {
        let body = input.trim();
        if body.is_empty() {
            return Ok(SendOutcome::Empty);
        }

        let response = self
            .api
            .send_text(body)
            .await
            .map_err(|e| failed("Sending message", e))?;
        if !response.success {
            return Err(failed("Sending message", RequestFailure::Rejected));
        }

        info!("Message accepted by server (id {:?})", response.message_id);
        Ok(SendOutcome::Sent {
            message_id: response.message_id,
        })
    }

    /// Upload one file. The server decides whether to accept it.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let file_name = display_name(path);
        let action = format!("Upload of {}", file_name);

        let contents = tokio::fs::read(path)
            .await
            .map_err(|e| failed(&action, RequestFailure::LocalFile(e.to_string())))?;

        info!("Uploading {} ({} bytes)", file_name, contents.len());
        let response = self
            .api
            .upload(&file_name, contents)
            .await
            .map_err(|e| failed(&action, e))?;
        if !response.success {
            return Err(failed(&action, RequestFailure::Rejected));
        }

        Ok(UploadReceipt {
            file_name,
            stored_as: response.filename,
            message_id: response.message_id,
        })
    }

    /// Upload a batch concurrently. Each file succeeds or fails on its own.
    pub async fn upload_files(&self, paths: Vec<PathBuf>) -> Vec<(PathBuf, Result<UploadReceipt, ClientError>)> {
        let uploads = paths.iter().map(|path| self.upload_file(path));
        let results = join_all(uploads).await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            warn!("{} of {} uploads failed", failures, results.len());
        }

        paths.into_iter().zip(results).collect()
    }
}

fn failed(action: &str, reason: RequestFailure) -> ClientError {
    let err = ClientError::request(action, reason);
    error!("{}", err);
    err
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
