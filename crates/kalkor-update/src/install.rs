use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kalkor_platform::{INSTALLED_RECORD, InstallLayout};
use log::{debug, warn};
use thiserror::Error;

use crate::error::UpdateError;
use crate::extract::ExtractedPayload;
use crate::fs_utils::{
    copy_atomically, is_current_exe, remove_dir_if_exists, remove_file_if_exists, replace_file,
};
use crate::launch::relaunch_app;
use crate::lock::{AppLock, InstallLock};
use crate::recovery::{RecoveryOutcome, finalize, recover_locked, roll_back};
use crate::transaction::{InstallState, JournalEntry, TransactionJournal};
use crate::update_log::UpdateLog;
use crate::version::{AppVersion, InstalledVersion};

const MACH_O_MAGICS: [[u8; 4]; 5] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("application still running after {}s", waited.as_secs())]
    ApplicationStillRunning { waited: Duration },
    #[error("failed to back up {}: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to swap {}: {source}", path.display())]
    SwapFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("installed files failed verification: {reason}")]
    InstallVerificationFailed { reason: String },
    #[error("rollback after {cause} failed: {}", failures.join("; "))]
    RollbackFailed { cause: String, failures: Vec<String> },
    #[error("another installer is working on this installation")]
    InstallerBusy,
    #[error("payload rejected: {0}")]
    PayloadInvalid(#[source] UpdateError),
    #[error("{context}: {source}")]
    Journal {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    pub(crate) fn journal(context: &'static str, source: std::io::Error) -> Self {
        Self::Journal { context, source }
    }

    /// Process exit code reported by the installer binary.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Journal { .. } => 1,
            Self::ApplicationStillRunning { .. } => 10,
            Self::BackupFailed { .. } => 11,
            Self::InstallVerificationFailed { .. } => 12,
            Self::SwapFailed { .. } => 13,
            Self::RollbackFailed { .. } => 14,
            Self::InstallerBusy => 15,
            Self::PayloadInvalid(_) => 16,
        }
    }

    /// Short name written to the update log.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Journal { .. } => "JournalError",
            Self::ApplicationStillRunning { .. } => "ApplicationStillRunning",
            Self::BackupFailed { .. } => "BackupFailed",
            Self::InstallVerificationFailed { .. } => "InstallVerificationFailed",
            Self::SwapFailed { .. } => "SwapFailed",
            Self::RollbackFailed { .. } => "RollbackFailed",
            Self::InstallerBusy => "InstallerBusy",
            Self::PayloadInvalid(_) => "PayloadInvalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub layout: InstallLayout,
    pub payload_dir: PathBuf,
    pub version: AppVersion,
    /// Upper bound for waiting on the application to exit.
    pub release_wait: Duration,
    pub poll_interval: Duration,
    pub relaunch: bool,
}

impl InstallRequest {
    pub fn new(layout: InstallLayout, payload_dir: impl Into<PathBuf>, version: AppVersion) -> Self {
        Self {
            layout,
            payload_dir: payload_dir.into(),
            version,
            release_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            relaunch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub version: AppVersion,
    pub previous_version: Option<AppVersion>,
    pub replaced_files: usize,
    /// Set when an earlier interrupted transaction was resolved first.
    pub recovered: Option<RecoveryOutcome>,
    pub relaunched: bool,
}

/// Swaps a staged payload into the live installation.
///
/// Every state change is journaled before the next step starts, so a crash
/// at any point leaves enough on disk for [`crate::recover`] to restore the
/// previous installation.
pub struct Installer<'a> {
    request: InstallRequest,
    log: &'a UpdateLog,
}

impl<'a> Installer<'a> {
    pub fn new(request: InstallRequest, log: &'a UpdateLog) -> Self {
        Self { request, log }
    }

    /// Run the whole transaction.
    ///
    /// # Errors
    /// See [`InstallError`]; every variant except `RollbackFailed` and
    /// `Journal` leaves the previous installation intact.
    pub fn run(&self) -> Result<InstallReport, InstallError> {
        let layout = &self.request.layout;
        let version = &self.request.version;

        let Some(_install_lock) = InstallLock::try_acquire(layout)
            .map_err(|source| InstallError::journal("failed to open install lock", source))?
        else {
            let error = InstallError::InstallerBusy;
            self.log.error(format!("{}: {error}", error.name()));
            return Err(error);
        };
        self.log.info(format!(
            "installer started: version {version} from {}",
            self.request.payload_dir.display()
        ));

        let recovered = match recover_locked(layout, self.log)? {
            RecoveryOutcome::Clean => None,
            outcome => Some(outcome),
        };

        let payload = ExtractedPayload::open(&self.request.payload_dir, version).map_err(|error| {
            let error = InstallError::PayloadInvalid(error);
            self.log.error(format!("{}: {error}", error.name()));
            error
        })?;
        let swap_set = swap_set(&payload);

        let previous_version = match InstalledVersion::read(layout) {
            Ok(record) => record.map(|record| record.version),
            Err(error) => {
                warn!("Ignoring unreadable installed version record: {error}");
                None
            }
        };

        let mut journal =
            TransactionJournal::new(version.clone(), previous_version.clone(), payload.root());
        journal
            .save(layout)
            .map_err(|source| InstallError::journal("failed to write install journal", source))?;
        self.log.info(format!("state {}", InstallState::Created));
        self.transition(&mut journal, InstallState::WaitingForRelease)
            .map_err(|source| {
                self.abandon();
                InstallError::journal("failed to write install journal", source)
            })?;

        let app_lock = match self.wait_for_release() {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                let _ = self.transition(&mut journal, InstallState::TimedOut);
                self.abandon();
                let error = InstallError::ApplicationStillRunning {
                    waited: self.request.release_wait,
                };
                self.log.error(format!("{}: {error}", error.name()));
                return Err(error);
            }
            Err(source) => {
                self.abandon();
                return Err(InstallError::journal("failed to open application lock", source));
            }
        };

        journal.entries = self.back_up(&swap_set).map_err(|error| {
            self.discard_backup();
            self.abandon();
            self.log.error(format!("{}: {error}", error.name()));
            error
        })?;
        if let Err(source) = self.transition(&mut journal, InstallState::BackedUp) {
            self.discard_backup();
            self.abandon();
            let error = InstallError::BackupFailed {
                path: layout.journal_file(),
                source,
            };
            self.log.error(format!("{}: {error}", error.name()));
            return Err(error);
        }

        for relative in &swap_set {
            if let Err(source) = swap_file(&payload.root().join(relative), &layout.root().join(relative))
            {
                return Err(self.fail_and_roll_back(
                    &mut journal,
                    InstallError::SwapFailed {
                        path: relative.clone(),
                        source,
                    },
                ));
            }
        }
        if let Err(source) = self.transition(&mut journal, InstallState::Swapped) {
            return Err(self.fail_and_roll_back(
                &mut journal,
                InstallError::SwapFailed {
                    path: layout.journal_file(),
                    source,
                },
            ));
        }

        if let Err(reason) = verify_executable(&layout.app_executable()) {
            return Err(self.fail_and_roll_back(
                &mut journal,
                InstallError::InstallVerificationFailed { reason },
            ));
        }
        if let Err(error) = InstalledVersion::write(layout, version) {
            return Err(self.fail_and_roll_back(
                &mut journal,
                InstallError::InstallVerificationFailed {
                    reason: error.to_string(),
                },
            ));
        }
        if let Err(source) = self.transition(&mut journal, InstallState::Committed) {
            return Err(self.fail_and_roll_back(
                &mut journal,
                InstallError::InstallVerificationFailed {
                    reason: format!("failed to record commit: {source}"),
                },
            ));
        }

        finalize(layout, &journal);
        drop(app_lock);
        self.log.info(format!(
            "committed version {version} ({} files replaced)",
            swap_set.len()
        ));

        let relaunched = self.request.relaunch
            && match relaunch_app(layout) {
                Ok(_) => true,
                Err(error) => {
                    self.log.error(format!("failed to relaunch application: {error}"));
                    false
                }
            };

        Ok(InstallReport {
            version: version.clone(),
            previous_version,
            replaced_files: swap_set.len(),
            recovered,
            relaunched,
        })
    }

    fn transition(
        &self,
        journal: &mut TransactionJournal,
        next: InstallState,
    ) -> std::io::Result<()> {
        let previous = journal.state;
        journal.advance(&self.request.layout, next)?;
        self.log.info(format!("state {previous} -> {next}"));
        Ok(())
    }

    /// Poll until the application lock is free and, on Windows, the
    /// executable image is no longer mapped. `Ok(None)` on timeout.
    fn wait_for_release(&self) -> std::io::Result<Option<AppLock>> {
        let layout = &self.request.layout;
        let started = Instant::now();
        loop {
            if let Some(lock) = AppLock::try_acquire(layout)? {
                if executable_released(&layout.app_executable()) {
                    debug!("Application released after {:?}", started.elapsed());
                    return Ok(Some(lock));
                }
                drop(lock);
            }
            if started.elapsed() >= self.request.release_wait {
                return Ok(None);
            }
            std::thread::sleep(self.request.poll_interval);
        }
    }

    fn back_up(&self, swap_set: &[PathBuf]) -> Result<Vec<JournalEntry>, InstallError> {
        let layout = &self.request.layout;
        let backup = layout.backup_dir();
        remove_dir_if_exists(&backup)
            .and_then(|()| std::fs::create_dir_all(&backup))
            .map_err(|source| InstallError::BackupFailed {
                path: backup.clone(),
                source,
            })?;

        let record = PathBuf::from(INSTALLED_RECORD);
        let mut entries = Vec::with_capacity(swap_set.len() + 1);
        for relative in swap_set.iter().chain(std::iter::once(&record)) {
            let live = layout.root().join(relative);
            let existed = live.is_file();
            if existed {
                copy_atomically(&live, &backup.join(relative)).map_err(|source| {
                    InstallError::BackupFailed {
                        path: relative.clone(),
                        source,
                    }
                })?;
            }
            entries.push(JournalEntry {
                path: relative.clone(),
                existed,
            });
        }
        Ok(entries)
    }

    fn fail_and_roll_back(
        &self,
        journal: &mut TransactionJournal,
        cause: InstallError,
    ) -> InstallError {
        self.log
            .error(format!("{}: {cause}; rolling back", cause.name()));
        match roll_back(&self.request.layout, journal, self.log) {
            Ok(()) => cause,
            Err(failures) => InstallError::RollbackFailed {
                cause: cause.to_string(),
                failures,
            },
        }
    }

    fn discard_backup(&self) {
        let backup = self.request.layout.backup_dir();
        if let Err(error) = remove_dir_if_exists(&backup) {
            warn!("Failed to remove backup {}: {error}", backup.display());
        }
    }

    /// Drop a journal that never reached `BackedUp`.
    fn abandon(&self) {
        if let Err(error) = TransactionJournal::clear(&self.request.layout) {
            warn!("Failed to remove install journal: {error}");
        }
    }
}

/// Payload files that replace live files. Updater bookkeeping and the
/// installed-version record are never taken from the archive.
fn swap_set(payload: &ExtractedPayload) -> Vec<PathBuf> {
    payload
        .install_files()
        .filter(|file| !InstallLayout::is_update_area(file) && *file != Path::new(INSTALLED_RECORD))
        .map(Path::to_path_buf)
        .collect()
}

fn swap_file(staged: &Path, live: &Path) -> std::io::Result<()> {
    if is_current_exe(live) {
        self_replace::self_replace(staged)?;
        remove_file_if_exists(staged)
    } else {
        replace_file(staged, live)
    }
}

#[cfg(windows)]
fn executable_released(exe: &Path) -> bool {
    !exe.exists()
        || std::fs::OpenOptions::new()
            .write(true)
            .open(exe)
            .is_ok()
}

#[cfg(not(windows))]
fn executable_released(_exe: &Path) -> bool {
    true
}

/// Check that `path` holds a runnable program: non-empty with an ELF, PE,
/// Mach-O or script header.
pub(crate) fn verify_executable(path: &Path) -> Result<(), String> {
    let file = std::fs::File::open(path).map_err(|error| format!("{}: {error}", path.display()))?;
    let mut header = Vec::with_capacity(4);
    file.take(4)
        .read_to_end(&mut header)
        .map_err(|error| format!("{}: {error}", path.display()))?;

    if header.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }
    if is_executable_header(&header) {
        Ok(())
    } else {
        Err(format!("{} has no recognised executable header", path.display()))
    }
}

fn is_executable_header(header: &[u8]) -> bool {
    header.starts_with(b"\x7fELF")
        || header.starts_with(b"MZ")
        || header.starts_with(b"#!")
        || MACH_O_MAGICS.iter().any(|magic| header.starts_with(magic))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kalkor_platform::{APP_BINARY, INSTALLER_BINARY, InstallLayout};

    use super::{InstallError, InstallRequest, Installer, is_executable_header, verify_executable};
    use crate::lock::AppLock;
    use crate::update_log::UpdateLog;
    use crate::version::{AppVersion, InstalledVersion};

    fn stage(layout: &InstallLayout, app: &[u8]) -> std::path::PathBuf {
        let payload = layout.staging_dir_for("1.2.0");
        std::fs::create_dir_all(&payload).expect("payload dir should be created");
        std::fs::write(payload.join(APP_BINARY), app).expect("app should be staged");
        std::fs::write(payload.join(INSTALLER_BINARY), b"#!/bin/sh\n")
            .expect("installer should be staged");
        payload
    }

    fn request(layout: &InstallLayout, payload: std::path::PathBuf) -> InstallRequest {
        let mut request = InstallRequest::new(layout.clone(), payload, AppVersion::new(1, 2, 0));
        request.release_wait = Duration::ZERO;
        request.poll_interval = Duration::from_millis(10);
        request.relaunch = false;
        request
    }

    #[test]
    fn headers_are_recognised() {
        assert!(is_executable_header(b"\x7fELF\x02"));
        assert!(is_executable_header(b"MZ\x90\x00"));
        assert!(is_executable_header(b"#!/bin/sh"));
        assert!(is_executable_header(&[0xcf, 0xfa, 0xed, 0xfe]));
        assert!(!is_executable_header(b"PK\x03\x04"));
        assert!(!is_executable_header(b"M"));
    }

    #[test]
    fn empty_executable_fails_verification() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("kalkor");
        std::fs::write(&path, b"").expect("file should be written");

        let reason = verify_executable(&path).expect_err("empty file should fail");
        assert!(reason.ends_with("is empty"));
    }

    #[test]
    fn running_application_times_out_without_touching_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        std::fs::write(layout.app_executable(), b"\x7fELF old").expect("live app should exist");
        let payload = stage(&layout, b"\x7fELF new");
        let _running = AppLock::try_acquire(&layout)
            .expect("lock should open")
            .expect("app lock should be granted");

        let error = Installer::new(request(&layout, payload), &UpdateLog::disabled())
            .run()
            .expect_err("held app lock should time out");

        assert!(matches!(error, InstallError::ApplicationStillRunning { .. }));
        assert_eq!(error.exit_code(), 10);
        assert_eq!(
            std::fs::read(layout.app_executable()).expect("live app should remain"),
            b"\x7fELF old"
        );
        assert!(!layout.journal_file().exists());
        assert!(!layout.backup_dir().exists());
    }

    #[test]
    fn unrecognised_app_is_rolled_back() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        std::fs::write(layout.app_executable(), b"\x7fELF old").expect("live app should exist");
        let payload = stage(&layout, b"not a program");

        let error = Installer::new(request(&layout, payload), &UpdateLog::disabled())
            .run()
            .expect_err("bad executable should fail verification");

        assert!(matches!(error, InstallError::InstallVerificationFailed { .. }));
        assert_eq!(error.exit_code(), 12);
        assert_eq!(
            std::fs::read(layout.app_executable()).expect("live app should be restored"),
            b"\x7fELF old"
        );
        assert!(!layout.installer_executable().exists());
        assert!(
            InstalledVersion::read(&layout)
                .expect("record read should succeed")
                .is_none()
        );
        assert!(!layout.journal_file().exists());
    }

    #[test]
    fn incomplete_payload_is_refused() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        let payload = layout.staging_dir_for("1.2.0");
        std::fs::create_dir_all(&payload).expect("payload dir should be created");
        std::fs::write(payload.join(APP_BINARY), b"\x7fELF").expect("app should be staged");

        let error = Installer::new(request(&layout, payload), &UpdateLog::disabled())
            .run()
            .expect_err("payload without installer should be refused");

        assert_eq!(error.exit_code(), 16);
        assert!(!layout.journal_file().exists());
    }
}
