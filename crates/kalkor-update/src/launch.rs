use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use kalkor_platform::{Detach, InstallLayout};
use log::info;

use crate::extract::ExtractedPayload;
use crate::fs_utils::copy_atomically;
use crate::version::AppVersion;

const INSTALLER_COPY_PREFIX: &str = "kalkor-installer-";

/// How the installer should behave once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    pub release_wait: Duration,
    pub poll_interval: Duration,
    pub relaunch: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            release_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            relaunch: true,
        }
    }
}

/// Where the installer binary of `version` is run from.
///
/// The installer never runs from the live directory, so no running image
/// is part of the swap set.
#[must_use]
pub fn installer_copy_path(layout: &InstallLayout, version: &AppVersion) -> PathBuf {
    layout.update_dir().join(format!(
        "{INSTALLER_COPY_PREFIX}{version}{}",
        std::env::consts::EXE_SUFFIX
    ))
}

pub(crate) fn is_installer_copy(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| name.starts_with(INSTALLER_COPY_PREFIX))
}

/// Arguments for an installer run against `payload`.
#[must_use]
pub fn installer_args(
    layout: &InstallLayout,
    payload: &ExtractedPayload,
    log_file: &Path,
    options: &LaunchOptions,
) -> Vec<String> {
    let mut args = vec![
        "--install-dir".to_string(),
        layout.root().display().to_string(),
        "--payload".to_string(),
        payload.root().display().to_string(),
        "--version".to_string(),
        payload.version().to_string(),
        "--log".to_string(),
        log_file.display().to_string(),
        "--wait-secs".to_string(),
        options.release_wait.as_secs().to_string(),
        "--poll-millis".to_string(),
        options.poll_interval.as_millis().to_string(),
    ];
    if !options.relaunch {
        args.push("--no-relaunch".to_string());
    }
    args
}

/// Copy the staged installer out of the payload and start it detached.
///
/// The caller is expected to exit right after; the installer waits for
/// the application lock before touching any file.
///
/// # Errors
/// Returns an error if the installer cannot be copied or spawned.
pub fn launch_installer(
    layout: &InstallLayout,
    payload: &ExtractedPayload,
    log_file: &Path,
    options: &LaunchOptions,
) -> std::io::Result<u32> {
    let installer = installer_copy_path(layout, payload.version());
    copy_atomically(&payload.installer_executable(), &installer)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&installer, std::fs::Permissions::from_mode(0o755))?;
    }

    let child = Command::new(&installer)
        .args(installer_args(layout, payload, log_file, options))
        .current_dir(layout.update_dir())
        .detach()
        .spawn()?;

    info!(
        "Launched installer {} (pid {}) for version {}",
        installer.display(),
        child.id(),
        payload.version()
    );
    Ok(child.id())
}

/// Start the installed application.
///
/// # Errors
/// Returns an error if the application cannot be spawned.
pub fn relaunch_app(layout: &InstallLayout) -> std::io::Result<u32> {
    let exe = layout.app_executable();
    info!("Relaunching {}", exe.display());
    let child = Command::new(&exe)
        .current_dir(layout.root())
        .detach()
        .spawn()?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::time::Duration;

    use kalkor_platform::{APP_BINARY, INSTALLER_BINARY, InstallLayout};

    use super::{LaunchOptions, installer_args, installer_copy_path, is_installer_copy};
    use crate::extract::ExtractedPayload;
    use crate::version::AppVersion;

    #[test]
    fn installer_copy_lives_in_update_dir() {
        let layout = InstallLayout::new("/opt/kalkor");
        let path = installer_copy_path(&layout, &AppVersion::new(1, 2, 0));

        assert!(path.starts_with(layout.update_dir()));
        let name = path.file_name().expect("copy should have a file name");
        assert!(is_installer_copy(name));
        assert!(!is_installer_copy(OsStr::new("install.lock")));
    }

    #[test]
    fn args_carry_payload_and_options() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let layout = InstallLayout::new(temp.path());
        let payload_dir = layout.staging_dir_for("1.2.0");
        std::fs::create_dir_all(&payload_dir).expect("payload dir should be created");
        std::fs::write(payload_dir.join(APP_BINARY), "app").expect("app should be written");
        std::fs::write(payload_dir.join(INSTALLER_BINARY), "installer")
            .expect("installer should be written");
        let payload = ExtractedPayload::open(&payload_dir, &AppVersion::new(1, 2, 0))
            .expect("payload should open");

        let args = installer_args(
            &layout,
            &payload,
            &temp.path().join("updater.log"),
            &LaunchOptions {
                release_wait: Duration::from_secs(45),
                poll_interval: Duration::from_millis(100),
                relaunch: false,
            },
        );

        let version = args
            .iter()
            .position(|arg| arg == "--version")
            .expect("version flag should be present");
        assert_eq!(args[version + 1], "1.2.0");
        let wait = args
            .iter()
            .position(|arg| arg == "--wait-secs")
            .expect("wait flag should be present");
        assert_eq!(args[wait + 1], "45");
        assert_eq!(args.last().map(String::as_str), Some("--no-relaunch"));
    }
}
