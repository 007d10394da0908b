use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kalkor_platform::InstallLayout;
use kalkor_update::{
    AppVersion, CheckOutcome, ErrorKind, ExtractedPayload, InstallError, InstalledVersion,
    LaunchOptions, RecoveryOutcome, UpdateLog, UpdateProgress, VersionManifest, build_http_client,
    check_for_update, cleanup_stale_staging, launch_installer, recover, stage_update,
};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::settings::UpdateSettings;

/// Result of one check, possibly followed by staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDecision {
    UpToDate {
        installed: AppVersion,
        latest: AppVersion,
    },
    /// The manifest could not be used; treated as "no update".
    Unavailable { kind: ErrorKind, reason: String },
    Available(VersionManifest),
    Staged(ExtractedPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub recovery: Option<RecoveryOutcome>,
    pub removed_stale: usize,
}

/// Runs update checks for one installation, one at a time.
pub struct UpdateCoordinator {
    client: reqwest::Client,
    layout: InstallLayout,
    settings: UpdateSettings,
    log: Arc<UpdateLog>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl UpdateCoordinator {
    pub fn new(
        layout: InstallLayout,
        settings: UpdateSettings,
        log: Arc<UpdateLog>,
    ) -> Result<Self, AppError> {
        let client = build_http_client(settings.connect_timeout(), settings.download_timeout())?;
        Ok(Self {
            client,
            layout,
            settings,
            log,
            in_flight: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    /// Token that aborts an in-flight check or download when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn installed_version(&self) -> AppVersion {
        InstalledVersion::read_or_current(&self.layout)
    }

    /// Resolve interrupted installs and drop stale staging. Never fails;
    /// problems are logged and the application starts regardless.
    pub fn startup(&self) -> StartupReport {
        let recovery = match recover(&self.layout, &self.log) {
            Ok(RecoveryOutcome::Clean) => None,
            Ok(outcome) => {
                info!("Recovered interrupted update: {outcome:?}");
                Some(outcome)
            }
            Err(InstallError::InstallerBusy) => {
                debug!("Installer still running, skipping recovery");
                None
            }
            Err(error) => {
                self.log.error(format!("{}: {error}", error.name()));
                None
            }
        };

        let removed_stale = cleanup_stale_staging(&self.layout).unwrap_or_else(|error| {
            warn!("Failed to clean up stale staging: {error}");
            0
        });

        StartupReport {
            recovery,
            removed_stale,
        }
    }

    /// Compare the installed version with the manifest.
    ///
    /// Manifest problems yield [`UpdateDecision::Unavailable`], never an error.
    pub async fn check(&self) -> Result<UpdateDecision, AppError> {
        let _guard = self.begin()?;
        self.check_inner().await
    }

    /// Check and, when a newer release exists, download, verify and stage
    /// it.
    pub async fn check_and_stage(
        &self,
        progress: Option<&mpsc::Sender<UpdateProgress>>,
    ) -> Result<UpdateDecision, AppError> {
        let _guard = self.begin()?;

        let manifest = match self.check_inner().await? {
            UpdateDecision::Available(manifest) => manifest,
            decision => return Ok(decision),
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.log.info(format!("update to {} cancelled", manifest.version));
                Err(AppError::cancelled("Update download"))
            }
            result = stage_update(
                &self.client,
                &self.layout,
                &manifest,
                &self.settings.retry_delays_secs,
                progress,
                &self.log,
            ) => result.map(UpdateDecision::Staged).map_err(AppError::from),
        }
    }

    /// Start the installer for `payload`. The caller must release its
    /// [`crate::SingleInstance`] and exit afterwards.
    pub fn hand_off(&self, payload: &ExtractedPayload, relaunch: bool) -> Result<u32, AppError> {
        let log_file = self
            .log
            .path()
            .map_or_else(|| self.layout.update_dir().join("updater.log"), PathBuf::from);
        let options = LaunchOptions {
            release_wait: self.settings.release_wait(),
            poll_interval: self.settings.release_poll(),
            relaunch,
        };

        let pid = launch_installer(&self.layout, payload, &log_file, &options)
            .map_err(|error| AppError::io("failed to launch installer", error))?;
        self.log.info(format!(
            "installer launched for {} (pid {pid})",
            payload.version()
        ));
        Ok(pid)
    }

    fn begin(&self) -> Result<InFlight, AppError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::UpdateInProgress)?;
        Ok(InFlight(Arc::clone(&self.in_flight)))
    }

    async fn check_inner(&self) -> Result<UpdateDecision, AppError> {
        let installed = self.installed_version();
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(AppError::cancelled("Update check")),
            result = check_for_update(
                &self.client,
                &self.settings.manifest_urls,
                self.settings.http_timeout(),
                &installed,
                &self.log,
            ) => result,
        };

        Ok(match result {
            Ok(CheckOutcome::UpToDate { installed, latest }) => {
                UpdateDecision::UpToDate { installed, latest }
            }
            Ok(CheckOutcome::UpdateAvailable { manifest, .. }) => {
                UpdateDecision::Available(manifest)
            }
            Err(error) => UpdateDecision::Unavailable {
                kind: error.kind(),
                reason: error.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kalkor_platform::InstallLayout;
    use kalkor_update::{ErrorKind, UpdateLog};

    use super::{UpdateCoordinator, UpdateDecision};
    use crate::error::AppError;
    use crate::settings::UpdateSettings;

    fn coordinator(root: &std::path::Path, urls: Vec<String>) -> UpdateCoordinator {
        let settings = UpdateSettings {
            manifest_urls: urls,
            retry_delays_secs: vec![0],
            ..UpdateSettings::default()
        };
        UpdateCoordinator::new(
            InstallLayout::new(root),
            settings,
            Arc::new(UpdateLog::disabled()),
        )
        .expect("coordinator should build")
    }

    #[test]
    fn only_one_check_runs_at_a_time() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let coordinator = coordinator(temp.path(), Vec::new());

        let first = coordinator.begin().expect("first check should start");
        assert!(coordinator.is_busy());
        assert!(matches!(
            coordinator.begin(),
            Err(AppError::UpdateInProgress)
        ));

        drop(first);
        assert!(!coordinator.is_busy());
        assert!(coordinator.begin().is_ok());
    }

    #[tokio::test]
    async fn cancelled_check_returns_cancelled() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let coordinator = coordinator(
            temp.path(),
            vec!["https://updates.invalid/latest_version.json".to_string()],
        );
        coordinator.cancel_token().cancel();

        let result = coordinator.check().await;

        assert!(matches!(result, Err(AppError::Cancelled { .. })));
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn unreachable_manifest_means_no_update() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/latest_version.json")
            .with_status(404)
            .create_async()
            .await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let coordinator = coordinator(
            temp.path(),
            vec![format!("{}/latest_version.json", server.url())],
        );

        let decision = coordinator
            .check_and_stage(None)
            .await
            .expect("manifest failure should not be an error");

        assert!(matches!(
            decision,
            UpdateDecision::Unavailable {
                kind: ErrorKind::ManifestUnreachable,
                ..
            }
        ));
        assert!(!temp.path().join(".update/downloads").exists());
    }

    #[test]
    fn startup_on_fresh_installation_is_quiet() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let coordinator = coordinator(temp.path(), Vec::new());

        let report = coordinator.startup();

        assert_eq!(report.recovery, None);
        assert_eq!(report.removed_stale, 0);
    }
}
