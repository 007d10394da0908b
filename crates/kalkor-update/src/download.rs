use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::UpdateError;
use crate::fs_utils::remove_file_if_exists;
use crate::pipeline::UpdateProgress;
use crate::verify::StagedArtifact;

/// Stream `url` into `dest` without holding the body in memory.
///
/// Bytes land in `<dest>.part` and are renamed to `dest` only after the
/// stream ends cleanly. On any failure the partial file is removed, so a
/// file at `dest` is always a complete transfer (not yet verified).
///
/// # Errors
/// `Network` on connection loss (before or during the transfer) or a
/// non-success status; `Disk` when the destination is unwritable or too
/// small for the declared size; `SizeMismatch` as soon as the body exceeds
/// `expected_size`.
pub async fn download_artifact(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    expected_size: Option<u64>,
    progress: Option<&mpsc::Sender<UpdateProgress>>,
) -> Result<StagedArtifact, UpdateError> {
    let part_path = part_path(dest);

    match stream_to_file(client, url, &part_path, expected_size, progress).await {
        Ok(downloaded) => {
            tokio::fs::rename(&part_path, dest).await.map_err(|error| {
                let _ = std::fs::remove_file(&part_path);
                UpdateError::io_with_path("failed to finalize download", dest, &error)
            })?;
            info!("Download complete: {downloaded} bytes to {}", dest.display());
            Ok(StagedArtifact::pending(dest.to_path_buf()))
        }
        Err(error) => {
            if let Err(cleanup) = remove_file_if_exists(&part_path) {
                warn!(
                    "Failed to remove partial download {}: {cleanup}",
                    part_path.display()
                );
            }
            Err(error)
        }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn stream_to_file(
    client: &reqwest::Client,
    url: &Url,
    part_path: &Path,
    expected_size: Option<u64>,
    progress: Option<&mpsc::Sender<UpdateProgress>>,
) -> Result<u64, UpdateError> {
    let parent = part_path.parent().ok_or_else(|| {
        UpdateError::io(
            "download path has no parent",
            std::io::Error::other(part_path.display().to_string()),
        )
    })?;
    tokio::fs::create_dir_all(parent).await.map_err(|error| {
        UpdateError::io_with_path("failed to create download directory", parent, &error)
    })?;

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|error| UpdateError::http("download request failed", error))?;

    if !response.status().is_success() {
        return Err(UpdateError::DownloadStatus {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let total = expected_size.or(response.content_length()).unwrap_or(0);
    ensure_free_space(parent, total)?;

    let mut file = tokio::fs::File::create(part_path).await.map_err(|error| {
        UpdateError::io_with_path("failed to create download file", part_path, &error)
    })?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| UpdateError::http("download stream error", error))?;
        let received = downloaded + chunk.len() as u64;
        if let Some(expected) = expected_size
            && received > expected
        {
            return Err(UpdateError::SizeMismatch {
                expected,
                actual: received,
            });
        }
        file.write_all(&chunk).await.map_err(|error| {
            UpdateError::io_with_path("failed to write download data", part_path, &error)
        })?;
        downloaded = received;
        if let Some(progress) = progress {
            let _ = progress
                .send(UpdateProgress::Downloading { downloaded, total })
                .await;
        }
    }

    file.flush().await.map_err(|error| {
        UpdateError::io_with_path("failed to flush download file", part_path, &error)
    })?;
    file.sync_all().await.map_err(|error| {
        UpdateError::io_with_path("failed to sync download file", part_path, &error)
    })?;

    Ok(downloaded)
}

fn ensure_free_space(dir: &Path, required: u64) -> Result<(), UpdateError> {
    if required == 0 {
        return Ok(());
    }
    match fs2::available_space(dir) {
        Ok(available) if available < required => Err(UpdateError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        }),
        Ok(_) => Ok(()),
        Err(error) => {
            debug!("Could not query free space in {}: {error}", dir.display());
            Ok(())
        }
    }
}
