use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use kalkor_platform::InstallLayout;
use kalkor_update::{AppVersion, InstallError, InstallRequest, Installer, RecoveryOutcome, UpdateLog};

#[derive(Parser, Debug)]
#[command(name = "kalkor-installer")]
#[command(about = "Applies a staged Kalkor update", long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Live installation directory.
    #[arg(long)]
    pub install_dir: PathBuf,

    /// Extracted payload to install.
    #[arg(long, required_unless_present = "recover", conflicts_with = "recover")]
    pub payload: Option<PathBuf>,

    /// Version the payload carries.
    #[arg(
        long = "version",
        value_name = "VERSION",
        required_unless_present = "recover",
        conflicts_with = "recover"
    )]
    pub target_version: Option<AppVersion>,

    /// Update log to append to.
    #[arg(long)]
    pub log: PathBuf,

    /// Seconds to wait for the application to exit.
    #[arg(long, default_value_t = 30)]
    pub wait_secs: u64,

    #[arg(long, default_value_t = 250)]
    pub poll_millis: u64,

    /// Do not start the application after committing.
    #[arg(long)]
    pub no_relaunch: bool,

    /// Only resolve an interrupted transaction.
    #[arg(long)]
    pub recover: bool,

    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    pub fn debug_log_path(&self) -> PathBuf {
        self.log.with_file_name("installer-debug.log")
    }

    /// # Errors
    /// A usage error when installing without a payload or version.
    pub fn mode(&self) -> Result<Mode, clap::Error> {
        if self.recover {
            return Ok(Mode::Recover);
        }
        match (&self.payload, &self.target_version) {
            (Some(payload), Some(version)) => Ok(Mode::Install {
                payload: payload.clone(),
                version: version.clone(),
            }),
            _ => Err(Self::command().error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "--payload and --version are required unless --recover is given",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Install { payload: PathBuf, version: AppVersion },
    Recover,
}

#[derive(Debug)]
pub enum Completed {
    Installed(AppVersion),
    Recovered(RecoveryOutcome),
}

pub fn run(cli: &Cli, mode: Mode, log: &UpdateLog) -> Result<Completed, InstallError> {
    let layout = InstallLayout::new(&cli.install_dir);

    let Mode::Install { payload, version } = mode else {
        return kalkor_update::recover(&layout, log).map(Completed::Recovered);
    };

    let mut request = InstallRequest::new(layout, payload, version);
    request.release_wait = Duration::from_secs(cli.wait_secs);
    request.poll_interval = Duration::from_millis(cli.poll_millis);
    request.relaunch = !cli.no_relaunch;

    let report = Installer::new(request, log).run()?;
    if let Some(recovered) = &report.recovered {
        log::info!("Resolved earlier transaction first: {recovered:?}");
    }
    Ok(Completed::Installed(report.version))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;
    use kalkor_update::AppVersion;

    #[test]
    fn install_arguments_parse() {
        let cli = Cli::try_parse_from([
            "kalkor-installer",
            "--install-dir",
            "/opt/kalkor",
            "--payload",
            "/opt/kalkor/.update/staging/1.2.0",
            "--version",
            "v1.2.0",
            "--log",
            "/var/log/kalkor/updater.log",
            "--wait-secs",
            "5",
            "--no-relaunch",
        ])
        .expect("install arguments should parse");

        assert_eq!(cli.target_version, Some(AppVersion::new(1, 2, 0)));
        assert_eq!(cli.wait_secs, 5);
        assert_eq!(cli.poll_millis, 250);
        assert!(cli.no_relaunch);
        assert!(!cli.recover);
        assert!(cli.debug_log_path().ends_with("installer-debug.log"));
    }

    #[test]
    fn recover_needs_no_payload() {
        let cli = Cli::try_parse_from([
            "kalkor-installer",
            "--install-dir",
            "/opt/kalkor",
            "--log",
            "updater.log",
            "--recover",
        ])
        .expect("recover arguments should parse");

        assert_eq!(cli.mode().expect("mode should resolve"), super::Mode::Recover);
        assert!(cli.payload.is_none());
    }

    #[test]
    fn install_without_payload_is_rejected() {
        let error = Cli::try_parse_from([
            "kalkor-installer",
            "--install-dir",
            "/opt/kalkor",
            "--log",
            "updater.log",
            "--version",
            "1.2.0",
        ])
        .expect_err("missing payload should be rejected");

        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn malformed_version_is_rejected() {
        let result = Cli::try_parse_from([
            "kalkor-installer",
            "--install-dir",
            "/opt/kalkor",
            "--payload",
            "/tmp/payload",
            "--version",
            "one.two",
            "--log",
            "updater.log",
        ]);

        assert!(result.is_err());
    }
}
