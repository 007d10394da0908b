use std::path::Path;

use kalkor_platform::InstallLayout;
use log::{debug, warn};

use crate::fs_utils::{copy_atomically, is_current_exe, remove_dir_if_exists, remove_file_if_exists};
use crate::install::InstallError;
use crate::launch::is_installer_copy;
use crate::lock::InstallLock;
use crate::transaction::{InstallState, TransactionJournal};
use crate::update_log::UpdateLog;
use crate::version::AppVersion;

/// What [`recover`] found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No interrupted transaction.
    Clean,
    /// The transaction never touched live files; leftovers were removed.
    Discarded { state: InstallState },
    /// Live files were restored from backup.
    RolledBack {
        from: InstallState,
        restored: Option<AppVersion>,
    },
    /// The transaction had committed; only cleanup was left.
    Finalized { version: AppVersion },
}

/// Detect and resolve an interrupted install transaction.
///
/// Safe to call on every application start. A journal whose installer still
/// holds the install lock belongs to a live transaction and is left alone.
///
/// # Errors
/// `InstallerBusy` while another installer runs, `RollbackFailed` when live
/// files could not be restored (the journal and backup are kept for the next
/// attempt), `Journal` when the journal is unreadable.
pub fn recover(layout: &InstallLayout, log: &UpdateLog) -> Result<RecoveryOutcome, InstallError> {
    if !layout.journal_file().exists() {
        return Ok(RecoveryOutcome::Clean);
    }
    let Some(_lock) = InstallLock::try_acquire(layout)
        .map_err(|source| InstallError::journal("failed to open install lock", source))?
    else {
        debug!("Install journal present but an installer is running");
        return Err(InstallError::InstallerBusy);
    };
    recover_locked(layout, log)
}

/// [`recover`] for a caller that already holds the install lock.
pub(crate) fn recover_locked(
    layout: &InstallLayout,
    log: &UpdateLog,
) -> Result<RecoveryOutcome, InstallError> {
    let Some(mut journal) = TransactionJournal::load(layout)
        .map_err(|source| InstallError::journal("failed to read install journal", source))?
    else {
        return Ok(RecoveryOutcome::Clean);
    };

    let state = journal.state;
    log.info(format!(
        "found interrupted install of {} in state {state}",
        journal.target_version
    ));

    if state.may_have_touched_live_files() {
        roll_back(layout, &mut journal, log).map_err(|failures| InstallError::RollbackFailed {
            cause: format!("interrupted install in state {state}"),
            failures,
        })?;
        return Ok(RecoveryOutcome::RolledBack {
            from: state,
            restored: journal.previous_version,
        });
    }

    if state == InstallState::Committed {
        finalize(layout, &journal);
        log.info(format!("finished cleanup of committed {}", journal.target_version));
        return Ok(RecoveryOutcome::Finalized {
            version: journal.target_version,
        });
    }

    discard(layout)?;
    log.info(format!("discarded install leftovers from state {state}"));
    Ok(RecoveryOutcome::Discarded { state })
}

/// Restore every journaled file from the backup directory.
///
/// Files that existed before the transaction are copied back; files the
/// transaction created are removed. On success the journal and backup are
/// deleted. On failure both are kept and the failed paths returned.
pub(crate) fn roll_back(
    layout: &InstallLayout,
    journal: &mut TransactionJournal,
    log: &UpdateLog,
) -> Result<(), Vec<String>> {
    if journal.state != InstallState::Failed
        && let Err(error) = journal.advance(layout, InstallState::Failed)
    {
        warn!("Failed to record failed install state: {error}");
    }

    let backup = layout.backup_dir();
    let mut failures = Vec::new();
    for entry in &journal.entries {
        let live = layout.root().join(&entry.path);
        let result = if entry.existed {
            restore_file(&backup.join(&entry.path), &live)
        } else {
            remove_file_if_exists(&live)
        };
        if let Err(error) = result {
            failures.push(format!("{}: {error}", entry.path.display()));
        }
    }

    if !failures.is_empty() {
        log.error(format!("rollback incomplete: {}", failures.join("; ")));
        return Err(failures);
    }

    if journal.state == InstallState::Failed
        && let Err(error) = journal.advance(layout, InstallState::RolledBack)
    {
        warn!("Failed to record rolled back install state: {error}");
    }
    if let Err(error) = TransactionJournal::clear(layout) {
        let failure = format!("failed to remove install journal: {error}");
        log.error(&failure);
        return Err(vec![failure]);
    }
    if let Err(error) = remove_dir_if_exists(&backup) {
        warn!("Failed to remove backup {}: {error}", backup.display());
    }

    log.info(format!(
        "state {} -> {}: restored {} files",
        InstallState::Failed,
        InstallState::RolledBack,
        journal.entries.len()
    ));
    Ok(())
}

fn restore_file(backup: &Path, live: &Path) -> std::io::Result<()> {
    if is_current_exe(live) {
        self_replace::self_replace(backup)
    } else {
        copy_atomically(backup, live)
    }
}

/// Remove what a committed transaction leaves behind.
pub(crate) fn finalize(layout: &InstallLayout, journal: &TransactionJournal) {
    for dir in [layout.backup_dir(), journal.payload_dir.clone()] {
        if let Err(error) = remove_dir_if_exists(&dir) {
            warn!("Failed to remove {}: {error}", dir.display());
        }
    }
    if let Err(error) = TransactionJournal::clear(layout) {
        warn!("Failed to remove committed install journal: {error}");
    }
}

fn discard(layout: &InstallLayout) -> Result<(), InstallError> {
    let backup = layout.backup_dir();
    if let Err(error) = remove_dir_if_exists(&backup) {
        warn!("Failed to remove partial backup {}: {error}", backup.display());
    }
    TransactionJournal::clear(layout)
        .map_err(|source| InstallError::journal("failed to remove install journal", source))
}

/// Remove staged payloads, downloads and installer copies left by earlier
/// runs. Skipped while a transaction is pending or an installer runs.
///
/// Returns how many entries were removed.
///
/// # Errors
/// Returns an error if the install lock cannot be opened.
pub fn cleanup_stale_staging(layout: &InstallLayout) -> std::io::Result<usize> {
    if layout.journal_file().exists() {
        debug!("Skipping staging cleanup: install journal present");
        return Ok(0);
    }
    let Some(_lock) = InstallLock::try_acquire(layout)? else {
        debug!("Skipping staging cleanup: installer running");
        return Ok(0);
    };

    let mut removed = 0;
    for dir in [layout.staging_root(), layout.downloads_dir()] {
        removed += clear_dir_contents(&dir);
    }

    let backup = layout.backup_dir();
    if backup.exists() {
        match remove_dir_if_exists(&backup) {
            Ok(()) => removed += 1,
            Err(error) => warn!("Failed to remove stale backup: {error}"),
        }
    }

    if let Ok(entries) = std::fs::read_dir(layout.update_dir()) {
        for entry in entries.filter_map(Result::ok) {
            if !is_installer_copy(&entry.file_name()) {
                continue;
            }
            match remove_file_if_exists(&entry.path()) {
                Ok(()) => removed += 1,
                Err(error) => debug!("Installer copy {} not removed: {error}", entry.path().display()),
            }
        }
    }

    if removed > 0 {
        debug!("Removed {removed} stale update entries");
    }
    Ok(removed)
}

fn clear_dir_contents(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let result = if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            remove_dir_if_exists(&path)
        } else {
            remove_file_if_exists(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) => warn!("Failed to remove {}: {error}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use kalkor_platform::InstallLayout;

    use super::{RecoveryOutcome, cleanup_stale_staging, recover};
    use crate::install::InstallError;
    use crate::lock::InstallLock;
    use crate::transaction::{InstallState, JournalEntry, TransactionJournal};
    use crate::update_log::UpdateLog;
    use crate::version::AppVersion;

    fn journal(layout: &InstallLayout, state: InstallState, entries: Vec<JournalEntry>) {
        let mut journal = TransactionJournal::new(
            AppVersion::new(1, 2, 0),
            Some(AppVersion::new(1, 1, 9)),
            &layout.staging_dir_for("1.2.0"),
        );
        journal.state = state;
        journal.entries = entries;
        journal.save(layout).expect("journal should save");
    }

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent should be created");
        }
        std::fs::write(path, content).expect("file should be written");
    }

    #[test]
    fn no_journal_is_clean() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());

        let outcome = recover(&layout, &UpdateLog::disabled()).expect("recovery should succeed");

        assert_eq!(outcome, RecoveryOutcome::Clean);
    }

    #[test]
    fn swapped_state_is_rolled_back_from_backup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        write(&layout.root().join("kalkor"), "new app");
        write(&layout.root().join("locale/new.json"), "added by update");
        write(&layout.backup_dir().join("kalkor"), "old app");
        journal(
            &layout,
            InstallState::Swapped,
            vec![
                JournalEntry {
                    path: "kalkor".into(),
                    existed: true,
                },
                JournalEntry {
                    path: "locale/new.json".into(),
                    existed: false,
                },
            ],
        );

        let outcome = recover(&layout, &UpdateLog::disabled()).expect("rollback should succeed");

        assert_eq!(
            outcome,
            RecoveryOutcome::RolledBack {
                from: InstallState::Swapped,
                restored: Some(AppVersion::new(1, 1, 9)),
            }
        );
        assert_eq!(
            std::fs::read_to_string(layout.root().join("kalkor")).expect("app should exist"),
            "old app"
        );
        assert!(!layout.root().join("locale/new.json").exists());
        assert!(!layout.journal_file().exists());
        assert!(!layout.backup_dir().exists());
    }

    #[test]
    fn waiting_state_only_discards_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        write(&layout.root().join("kalkor"), "live app");
        write(&layout.backup_dir().join("kalkor"), "partial backup");
        journal(&layout, InstallState::WaitingForRelease, Vec::new());

        let outcome = recover(&layout, &UpdateLog::disabled()).expect("recovery should succeed");

        assert_eq!(
            outcome,
            RecoveryOutcome::Discarded {
                state: InstallState::WaitingForRelease
            }
        );
        assert_eq!(
            std::fs::read_to_string(layout.root().join("kalkor")).expect("app should exist"),
            "live app"
        );
        assert!(!layout.backup_dir().exists());
        assert!(!layout.journal_file().exists());
    }

    #[test]
    fn committed_state_finishes_cleanup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        write(&layout.backup_dir().join("kalkor"), "old app");
        write(&layout.staging_dir_for("1.2.0").join("manifest.json"), "{}");
        journal(&layout, InstallState::Committed, Vec::new());

        let outcome = recover(&layout, &UpdateLog::disabled()).expect("recovery should succeed");

        assert_eq!(
            outcome,
            RecoveryOutcome::Finalized {
                version: AppVersion::new(1, 2, 0)
            }
        );
        assert!(!layout.backup_dir().exists());
        assert!(!layout.staging_dir_for("1.2.0").exists());
    }

    #[test]
    fn missing_backup_keeps_journal_for_next_attempt() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        write(&layout.root().join("kalkor"), "new app");
        journal(
            &layout,
            InstallState::BackedUp,
            vec![JournalEntry {
                path: "kalkor".into(),
                existed: true,
            }],
        );

        let error = recover(&layout, &UpdateLog::disabled()).expect_err("rollback should fail");

        assert!(matches!(error, InstallError::RollbackFailed { .. }));
        assert_eq!(error.exit_code(), 14);
        let kept = TransactionJournal::load(&layout)
            .expect("journal should load")
            .expect("journal should be kept");
        assert_eq!(kept.state, InstallState::Failed);
    }

    #[test]
    fn running_installer_is_not_disturbed() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        journal(&layout, InstallState::BackedUp, Vec::new());
        let _held = InstallLock::try_acquire(&layout)
            .expect("lock should open")
            .expect("lock should be granted");

        let error = recover(&layout, &UpdateLog::disabled()).expect_err("busy installer");

        assert!(matches!(error, InstallError::InstallerBusy));
        assert!(layout.journal_file().exists());
        assert_eq!(
            cleanup_stale_staging(&layout).expect("cleanup should not fail"),
            0
        );
    }

    #[test]
    fn stale_staging_is_removed() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        write(&layout.staging_dir_for("1.2.0").join("kalkor"), "staged");
        write(&layout.downloads_dir().join("kalkor-1.2.0.zip.part"), "partial");
        write(
            &layout
                .update_dir()
                .join(format!("kalkor-installer-1.2.0{}", std::env::consts::EXE_SUFFIX)),
            "installer copy",
        );

        let removed = cleanup_stale_staging(&layout).expect("cleanup should succeed");

        assert_eq!(removed, 3);
        assert!(layout.staging_root().is_dir());
        assert_eq!(
            std::fs::read_dir(layout.staging_root())
                .expect("staging should be readable")
                .count(),
            0
        );
        assert!(!layout.downloads_dir().join("kalkor-1.2.0.zip.part").exists());
    }
}
