use std::path::{Path, PathBuf};

use thiserror::Error;

const APP_DIR: &str = "Kalkor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("no per-user configuration directory on this system")]
    NoConfigDir,
    #[error("no per-user data directory on this system")]
    NoDataDir,
}

/// Per-user locations for settings and logs.
///
/// Installation files never live here; see [`crate::InstallLayout`] for the
/// live installation and its `.update` area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppPaths {
    /// Resolve the platform directories for the current user.
    ///
    /// Logs go to the local (non-roaming) data directory on Windows and to
    /// `~/Library/Logs` on macOS.
    ///
    /// # Errors
    /// Returns an error when the platform reports no config or data
    /// directory, e.g. for a user without a home directory.
    pub fn new() -> Result<Self, AppPathsError> {
        let config_dir = dirs::config_dir().ok_or(AppPathsError::NoConfigDir)?;

        #[cfg(target_os = "macos")]
        let log_dir = dirs::home_dir()
            .ok_or(AppPathsError::NoDataDir)?
            .join("Library/Logs")
            .join(APP_DIR);
        #[cfg(not(target_os = "macos"))]
        let log_dir = dirs::data_local_dir()
            .ok_or(AppPathsError::NoDataDir)?
            .join(APP_DIR)
            .join("logs");

        Ok(Self {
            config_dir: config_dir.join(APP_DIR),
            log_dir,
        })
    }

    /// Paths rooted at `base`, for portable installs and tests.
    #[must_use]
    pub fn under(base: &Path) -> Self {
        Self {
            config_dir: base.join("config"),
            log_dir: base.join("logs"),
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    /// Diagnostic log written through the `log` facade.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("debug.log")
    }

    /// Append-only record of update steps, shared with the installer.
    #[must_use]
    pub fn update_log_file(&self) -> PathBuf {
        self.log_dir.join("updater.log")
    }

    /// # Errors
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.config_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
