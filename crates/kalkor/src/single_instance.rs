use kalkor_platform::InstallLayout;
use kalkor_update::AppLock;

use crate::error::AppError;

/// Marks this installation as in use for as long as it lives.
///
/// The installer waits for this lock before touching live files, so it must
/// be dropped before the process hands off to an installer and exits.
pub struct SingleInstance {
    _lock: AppLock,
}

impl SingleInstance {
    pub fn acquire(layout: &InstallLayout) -> Result<Self, AppError> {
        match AppLock::try_acquire(layout) {
            Ok(Some(lock)) => Ok(Self { _lock: lock }),
            Ok(None) => Err(AppError::AlreadyRunning),
            Err(error) => Err(AppError::io("failed to acquire application lock", error)),
        }
    }
}
