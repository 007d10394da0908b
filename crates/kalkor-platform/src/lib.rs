mod commands;
mod layout;
mod paths;

pub use commands::Detach;
pub use layout::{APP_BINARY, INSTALLER_BINARY, INSTALLED_RECORD, InstallLayout, MANIFEST_COPY};
pub use paths::{AppPaths, AppPathsError};
