use kalkor_update::{InstallError, UpdateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("another Kalkor instance is already running")]
    AlreadyRunning,
    #[error("an update check is already in progress")]
    UpdateInProgress,
    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },
    #[error("failed to resolve application paths: {0}")]
    Paths(#[from] kalkor_platform::AppPathsError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Install(#[from] InstallError),
}

impl AppError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub fn cancelled(operation: &'static str) -> Self {
        Self::Cancelled { operation }
    }
}

#[cfg(test)]
mod tests {
    use kalkor_update::InstallError;

    use super::AppError;

    #[test]
    fn install_errors_keep_their_message() {
        let error = AppError::from(InstallError::InstallerBusy);
        assert_eq!(
            error.to_string(),
            "another installer is working on this installation"
        );
        assert_eq!(
            AppError::cancelled("Update download").to_string(),
            "Update download was cancelled"
        );
    }
}
