use std::time::Duration;

use kalkor_platform::InstallLayout;
use log::debug;
use tokio::sync::mpsc;

use crate::download::download_artifact;
use crate::error::UpdateError;
use crate::extract::{ExtractedPayload, extract_payload};
use crate::manifest::{VersionManifest, fetch_manifest_from_mirrors};
use crate::update_log::UpdateLog;
use crate::verify::{StagedArtifact, verify_artifact};
use crate::version::{AppVersion, needs_update};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateProgress {
    Downloading { downloaded: u64, total: u64 },
    Verifying,
    Extracting,
    Staged { version: AppVersion },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpToDate {
        installed: AppVersion,
        latest: AppVersion,
    },
    UpdateAvailable {
        installed: AppVersion,
        manifest: VersionManifest,
    },
}

/// Fetch the manifest and compare it against the installed version.
///
/// Writes exactly one update-log entry for the decision.
///
/// # Errors
/// Manifest errors from [`fetch_manifest_from_mirrors`]; callers treat
/// those as "no update available" (see [`UpdateError::means_no_update`]).
pub async fn check_for_update(
    client: &reqwest::Client,
    manifest_urls: &[String],
    timeout: Duration,
    installed: &AppVersion,
    log: &UpdateLog,
) -> Result<CheckOutcome, UpdateError> {
    let manifest = match fetch_manifest_from_mirrors(client, manifest_urls, timeout).await {
        Ok(manifest) => manifest,
        Err(error) => {
            log.error(format!("{}: {error}", error.kind()));
            return Err(error);
        }
    };

    if needs_update(installed, &manifest) {
        log.info(format!(
            "update available: {installed} -> {}",
            manifest.version
        ));
        Ok(CheckOutcome::UpdateAvailable {
            installed: installed.clone(),
            manifest,
        })
    } else {
        log.info(format!(
            "up to date: installed {installed}, latest {}",
            manifest.version
        ));
        Ok(CheckOutcome::UpToDate {
            installed: installed.clone(),
            latest: manifest.version,
        })
    }
}

/// Download, verify and extract the release described by `manifest`.
///
/// Network failures are retried with `retry_delays_secs` (one attempt per
/// entry, each preceded by its delay); every other failure ends the run.
/// The archive is deleted once extraction finishes, successful or not.
///
/// # Errors
/// Any [`UpdateError`] from the download, verification or extraction step.
pub async fn stage_update(
    client: &reqwest::Client,
    layout: &InstallLayout,
    manifest: &VersionManifest,
    retry_delays_secs: &[u64],
    progress: Option<&mpsc::Sender<UpdateProgress>>,
    log: &UpdateLog,
) -> Result<ExtractedPayload, UpdateError> {
    layout
        .ensure_update_dirs()
        .map_err(|error| UpdateError::io("failed to create update directories", error))
        .inspect_err(|error| log.error(format!("{}: {error}", error.kind())))?;

    log.info(format!("downloading {}", manifest.archive_url));
    let artifact = download_with_retries(client, layout, manifest, retry_delays_secs, progress, log)
        .await
        .inspect_err(|error| log.error(format!("{}: {error}", error.kind())))?;

    notify(progress, UpdateProgress::Verifying).await;
    let artifact = verify_artifact(artifact, manifest)
        .inspect_err(|error| log.error(format!("{}: {error}", error.kind())))?;
    log.info(format!("checksum verified for {}", manifest.version));

    notify(progress, UpdateProgress::Extracting).await;
    let extracted = extract_payload(&artifact, &layout.staging_root(), &manifest.version);
    artifact.discard();
    let payload =
        extracted.inspect_err(|error| log.error(format!("{}: {error}", error.kind())))?;

    log.info(format!(
        "staged version {} at {}",
        payload.version(),
        payload.root().display()
    ));
    notify(
        progress,
        UpdateProgress::Staged {
            version: payload.version().clone(),
        },
    )
    .await;
    Ok(payload)
}

async fn download_with_retries(
    client: &reqwest::Client,
    layout: &InstallLayout,
    manifest: &VersionManifest,
    retry_delays_secs: &[u64],
    progress: Option<&mpsc::Sender<UpdateProgress>>,
    log: &UpdateLog,
) -> Result<StagedArtifact, UpdateError> {
    let dest = layout.downloads_dir().join(manifest.archive_file_name());
    let mut delays = retry_delays_secs.iter().copied();
    let mut delay_secs = delays.next().unwrap_or(0);
    let mut attempt = 1;

    loop {
        if delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        }

        match download_artifact(
            client,
            &manifest.archive_url,
            &dest,
            manifest.archive_size,
            progress,
        )
        .await
        {
            Ok(artifact) => return Ok(artifact),
            Err(error) if error.is_retryable() => {
                let Some(next) = delays.next() else {
                    return Err(error);
                };
                debug!("Download attempt {attempt} failed: {error}");
                log.error(format!("download attempt {attempt} failed, retrying: {error}"));
                delay_secs = next;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

async fn notify(progress: Option<&mpsc::Sender<UpdateProgress>>, event: UpdateProgress) {
    if let Some(progress) = progress {
        let _ = progress.send(event).await;
    }
}
