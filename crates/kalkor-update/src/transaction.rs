use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kalkor_platform::InstallLayout;
use serde::{Deserialize, Serialize};

use crate::fs_utils::{remove_file_if_exists, write_atomically};
use crate::version::AppVersion;

/// Lifecycle of an install transaction.
///
/// Success: `Created -> WaitingForRelease -> BackedUp -> Swapped -> Committed`.
/// Failure after backup: `... BackedUp -> Failed -> RolledBack`.
/// Timeout: `Created -> WaitingForRelease -> TimedOut`, nothing touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    Created,
    WaitingForRelease,
    BackedUp,
    Swapped,
    Committed,
    Failed,
    RolledBack,
    TimedOut,
}

impl InstallState {
    /// Whether live files may differ from the pre-transaction state.
    #[must_use]
    pub fn may_have_touched_live_files(self) -> bool {
        matches!(self, Self::BackedUp | Self::Swapped | Self::Failed)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::WaitingForRelease)
                | (Self::WaitingForRelease, Self::BackedUp | Self::TimedOut | Self::Failed)
                | (Self::BackedUp, Self::Swapped | Self::Failed)
                | (Self::Swapped, Self::Committed | Self::Failed)
                | (Self::Failed, Self::RolledBack)
        )
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A live file the transaction replaces, relative to the install root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub path: PathBuf,
    /// Whether the file existed before the swap. Files that did not are
    /// removed on rollback instead of restored.
    pub existed: bool,
}

/// Durable record of an install transaction, rewritten atomically on
/// every state change.
///
/// Its presence at `.update/transaction.json` while no installer holds the
/// install lock marks an interrupted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournal {
    pub id: String,
    pub target_version: AppVersion,
    /// `None` when no installed-version record existed.
    #[serde(default)]
    pub previous_version: Option<AppVersion>,
    pub state: InstallState,
    pub payload_dir: PathBuf,
    #[serde(default)]
    pub entries: Vec<JournalEntry>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionJournal {
    #[must_use]
    pub fn new(
        target_version: AppVersion,
        previous_version: Option<AppVersion>,
        payload_dir: &Path,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{target_version}-{}", now.timestamp()),
            target_version,
            previous_version,
            state: InstallState::Created,
            payload_dir: payload_dir.to_path_buf(),
            entries: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// # Errors
    /// Returns an error if the journal exists but cannot be read or parsed.
    pub fn load(layout: &InstallLayout) -> std::io::Result<Option<Self>> {
        let path = layout.journal_file();
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))
    }

    /// # Errors
    /// Returns an error if the journal cannot be serialized or written.
    pub fn save(&self, layout: &InstallLayout) -> std::io::Result<()> {
        let content = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomically(&layout.journal_file(), &content)
    }

    /// # Errors
    /// Returns an error if the journal exists and cannot be removed.
    pub fn clear(layout: &InstallLayout) -> std::io::Result<()> {
        remove_file_if_exists(&layout.journal_file())
    }

    /// Move to `next` and persist before returning.
    ///
    /// # Errors
    /// Returns an error for an illegal transition or when the journal cannot
    /// be written; the in-memory state is unchanged in both cases.
    pub fn advance(&mut self, layout: &InstallLayout, next: InstallState) -> std::io::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(std::io::Error::other(format!(
                "illegal install transition {} -> {next}",
                self.state
            )));
        }
        let previous = self.state;
        self.state = next;
        self.updated_at = Utc::now();
        if let Err(error) = self.save(layout) {
            self.state = previous;
            return Err(error);
        }
        Ok(())
    }
}
