use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use kalkor_platform::InstallLayout;

/// Exclusive advisory lock on a file below `.update`.
///
/// The OS drops the lock when the holding process exits, including on a
/// crash or kill, so a stale lock file never blocks a later run.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Try to take the lock without waiting. `Ok(None)` means another
    /// holder has it.
    ///
    /// # Errors
    /// Returns an error if the lock file cannot be opened or the lock call
    /// fails for a reason other than contention.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if is_contended(&error) => return Ok(None),
            Err(error) => return Err(error),
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))?;

        Ok(Some(Self { _file: file }))
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Held by the running application for its whole lifetime; the installer
/// waits until it can take it.
#[derive(Debug)]
pub struct AppLock(FileLock);

impl AppLock {
    /// # Errors
    /// See [`FileLock::try_acquire`].
    pub fn try_acquire(layout: &InstallLayout) -> std::io::Result<Option<Self>> {
        Ok(FileLock::try_acquire(&layout.app_lock_file())?.map(Self))
    }
}

/// Held by an installer for the duration of a transaction. Only one
/// installer may work on an installation directory at a time.
#[derive(Debug)]
pub struct InstallLock(FileLock);

impl InstallLock {
    /// # Errors
    /// See [`FileLock::try_acquire`].
    pub fn try_acquire(layout: &InstallLayout) -> std::io::Result<Option<Self>> {
        Ok(FileLock::try_acquire(&layout.install_lock_file())?.map(Self))
    }
}

#[cfg(test)]
mod tests {
    use kalkor_platform::InstallLayout;

    use super::{AppLock, InstallLock};

    #[test]
    fn second_holder_is_refused_until_release() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());

        let first = InstallLock::try_acquire(&layout)
            .expect("lock should open")
            .expect("first lock should be granted");
        assert!(
            InstallLock::try_acquire(&layout)
                .expect("lock should open")
                .is_none()
        );

        drop(first);
        assert!(
            InstallLock::try_acquire(&layout)
                .expect("lock should open")
                .is_some()
        );
    }

    #[test]
    fn app_and_install_locks_are_independent() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());

        let _app = AppLock::try_acquire(&layout)
            .expect("lock should open")
            .expect("app lock should be granted");
        let install = InstallLock::try_acquire(&layout).expect("lock should open");

        assert!(install.is_some());
        #[cfg(unix)]
        {
            let pid =
                std::fs::read_to_string(layout.app_lock_file()).expect("lock file readable");
            assert_eq!(pid.trim(), std::process::id().to_string());
        }
    }
}
