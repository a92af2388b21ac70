// Download retrieval
// Streams a file body in chunks, then saves it under its display name

use futures_util::StreamExt;
use log::{debug, error, info};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{ClientError, RequestFailure};
use crate::sync::http::ChatApi;

// Highest ` (n)` suffix tried before giving up on a name
const MAX_NAME_SUFFIX: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    /// Declared body length, when the server sent one
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`, or `None` without a declared length.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.received as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Fetch `token` and save it in `dest_dir` as `display_name`.
///
/// The body is assembled in memory first. Nothing is written to `dest_dir` unless the
/// whole body arrived, so a failed download leaves no partial file behind.
pub async fn download<F>(
    api: &dyn ChatApi,
    token: &str,
    display_name: &str,
    dest_dir: &Path,
    mut progress: F,
) -> Result<PathBuf, ClientError>
where
    F: FnMut(DownloadProgress) + Send,
{
    let file_name = safe_file_name(display_name, token);
    let action = format!("Download of {}", file_name);

    let mut body = api.download(token).await.map_err(|e| failed(&action, e))?;
    let total = body.total;
    let mut data: Vec<u8> = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);

    progress(DownloadProgress { received: 0, total });
    while let Some(chunk) = body.chunks.next().await {
        let chunk = chunk.map_err(|e| failed(&action, e))?;
        data.extend_from_slice(&chunk);
        progress(DownloadProgress {
            received: data.len() as u64,
            total,
        });
    }
    debug!("Received {} bytes for {}", data.len(), token);

    let dir = dest_dir.to_path_buf();
    let name = file_name.clone();
    let path = tokio::task::spawn_blocking(move || save(&dir, &name, &data))
        .await
        .map_err(|e| std::io::Error::new(ErrorKind::Other, e))
        .and_then(|saved| saved)
        .map_err(|e| failed(&action, RequestFailure::LocalFile(e.to_string())))?;
    info!("Saved {} to {}", token, path.display());
    Ok(path)
}

fn failed(action: &str, reason: RequestFailure) -> ClientError {
    let err = ClientError::request(action, reason);
    error!("{}", err);
    err
}

// Write through a temp file in the same directory so the final name only ever
// appears with complete contents. Existing files are never replaced: a name taken
// between the check and the rename moves on to the next candidate.
fn save(dest_dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dest_dir)?;
    temp.write_all(data)?;
    temp.flush()?;

    for target in candidate_paths(dest_dir, file_name) {
        if target.exists() {
            continue;
        }
        match temp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!("{} appeared while saving, trying the next name", target.display());
                temp = e.file;
            }
            Err(e) => return Err(e.error),
        }
    }
    Err(std::io::Error::new(ErrorKind::AlreadyExists, format!("no free name for {}", file_name)))
}

/// Strip directory parts from a server-provided name. Falls back to the token, then
/// to a fixed name, when nothing usable is left.
pub fn safe_file_name(display_name: &str, token: &str) -> String {
    [display_name, token]
        .iter()
        .filter_map(|candidate| {
            Path::new(candidate.trim())
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .find(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string())
}

/// `name`, then `name (n).ext` for n = 1, 2, ...
fn candidate_paths<'a>(dir: &'a Path, name: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    std::iter::once(dir.join(name)).chain((1..=MAX_NAME_SUFFIX).map(move |n| match &ext {
        Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
        None => dir.join(format!("{} ({})", stem, n)),
    }))
}
