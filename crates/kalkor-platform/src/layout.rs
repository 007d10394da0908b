use std::path::{Path, PathBuf};

#[cfg(windows)]
pub const APP_BINARY: &str = "kalkor.exe";
#[cfg(not(windows))]
pub const APP_BINARY: &str = "kalkor";

#[cfg(windows)]
pub const INSTALLER_BINARY: &str = "kalkor-installer.exe";
#[cfg(not(windows))]
pub const INSTALLER_BINARY: &str = "kalkor-installer";

/// Name of the manifest copy shipped inside every release archive.
pub const MANIFEST_COPY: &str = "manifest.json";

/// Installed-version record, relative to the install root.
pub const INSTALLED_RECORD: &str = "installed.json";

const UPDATE_DIR: &str = ".update";

/// Filesystem layout of one installation directory.
///
/// Everything the updater writes besides the live files lives under
/// `<install>/.update`, so staging, backup and the live tree share a
/// filesystem and renames between them stay atomic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout of the installation that contains the running executable.
    ///
    /// # Errors
    /// Returns an error if the current executable path cannot be resolved.
    pub fn current() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let root = exe
            .parent()
            .ok_or_else(|| std::io::Error::other("current executable has no parent directory"))?;
        Ok(Self::new(root))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn app_executable(&self) -> PathBuf {
        self.root.join(APP_BINARY)
    }

    #[must_use]
    pub fn installer_executable(&self) -> PathBuf {
        self.root.join(INSTALLER_BINARY)
    }

    #[must_use]
    pub fn installed_version_file(&self) -> PathBuf {
        self.root.join(INSTALLED_RECORD)
    }

    #[must_use]
    pub fn update_dir(&self) -> PathBuf {
        self.root.join(UPDATE_DIR)
    }

    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.update_dir().join("downloads")
    }

    #[must_use]
    pub fn staging_root(&self) -> PathBuf {
        self.update_dir().join("staging")
    }

    #[must_use]
    pub fn staging_dir_for(&self, version: &str) -> PathBuf {
        self.staging_root().join(version)
    }

    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.update_dir().join("backup")
    }

    #[must_use]
    pub fn journal_file(&self) -> PathBuf {
        self.update_dir().join("transaction.json")
    }

    #[must_use]
    pub fn install_lock_file(&self) -> PathBuf {
        self.update_dir().join("install.lock")
    }

    #[must_use]
    pub fn app_lock_file(&self) -> PathBuf {
        self.update_dir().join("app.lock")
    }

    /// Whether a path relative to the root belongs to the updater's own area.
    #[must_use]
    pub fn is_update_area(relative: &Path) -> bool {
        relative
            .components()
            .next()
            .is_some_and(|first| first.as_os_str() == UPDATE_DIR)
    }

    /// Create the `.update` directory tree.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_update_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.downloads_dir())?;
        std::fs::create_dir_all(self.staging_root())?;
        Ok(())
    }
}
