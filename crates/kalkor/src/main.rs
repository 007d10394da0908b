use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kalkor::{
    AppError, SingleInstance, StartupReport, UpdateCoordinator, UpdateDecision, UpdateSettings,
};
use kalkor_platform::{AppPaths, InstallLayout};
use kalkor_update::logging::init_logging;
use kalkor_update::{AppVersion, UpdateLog, UpdateProgress, recover};
use log::{debug, info, warn};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "kalkor", version, about = "Kalkor update manager")]
struct Cli {
    /// Installation to operate on; defaults to the directory of this binary.
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,

    /// Keep settings and logs under this directory instead of the per-user
    /// locations.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Without a subcommand Kalkor starts normally: it resolves interrupted
    /// installs, cleans stale staging and checks for updates if enabled.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the manifest mirrors whether a newer release exists.
    Check,
    /// Download, verify and stage the newest release, then hand it to the installer.
    Update {
        /// Do not start Kalkor again once the installer commits.
        #[arg(long)]
        no_relaunch: bool,
    },
    /// Resolve an interrupted install.
    Recover,
    /// Show installed and binary versions.
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match &cli.data_dir {
        Some(dir) => Ok(AppPaths::under(dir)),
        None => AppPaths::new(),
    };
    let (settings, log) = match paths {
        Ok(paths) => {
            if let Err(error) = paths.ensure_dirs() {
                eprintln!("Failed to create application directories: {error}");
            }
            let settings = UpdateSettings::load_or_create(&paths.settings_file());
            init_logging(
                &paths.log_file(),
                settings.debug_logging,
                settings.max_log_size_bytes,
            );
            (settings, UpdateLog::open(paths.update_log_file()))
        }
        Err(error) => {
            eprintln!("Using default settings, logging disabled: {error}");
            (UpdateSettings::default(), UpdateLog::disabled())
        }
    };

    let layout = match cli.install_dir.clone() {
        Some(dir) => InstallLayout::new(dir),
        None => match InstallLayout::current() {
            Ok(layout) => layout,
            Err(error) => {
                eprintln!("Failed to locate installation: {error}");
                return ExitCode::FAILURE;
            }
        },
    };
    debug!("Using installation at {}", layout.root().display());

    match run(cli.command, layout, settings, Arc::new(log)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    command: Option<Command>,
    layout: InstallLayout,
    settings: UpdateSettings,
    log: Arc<UpdateLog>,
) -> Result<(), AppError> {
    let Some(command) = command else {
        return start(layout, settings, log).await;
    };

    match command {
        Command::Check => {
            let coordinator = UpdateCoordinator::new(layout, settings, log)?;
            report_startup(&coordinator.startup());
            print_decision(&coordinator.check().await?);
            Ok(())
        }
        Command::Update { no_relaunch } => update(layout, settings, log, !no_relaunch).await,
        Command::Recover => {
            let outcome = recover(&layout, &log)?;
            println!("{outcome:?}");
            Ok(())
        }
        Command::Version => {
            let coordinator = UpdateCoordinator::new(layout, settings, log)?;
            println!("installed: {}", coordinator.installed_version());
            println!("binary:    {}", AppVersion::current());
            Ok(())
        }
    }
}

/// Regular application start, also what the installer runs after a commit.
async fn start(
    layout: InstallLayout,
    settings: UpdateSettings,
    log: Arc<UpdateLog>,
) -> Result<(), AppError> {
    let instance = SingleInstance::acquire(&layout)?;
    let check_on_startup = settings.check_on_startup;
    let coordinator = UpdateCoordinator::new(layout, settings, log)?;

    report_startup(&coordinator.startup());
    info!("Kalkor {} started", coordinator.installed_version());

    if check_on_startup {
        cancel_on_interrupt(&coordinator);
        match coordinator.check().await {
            Ok(decision) => print_decision(&decision),
            Err(error) => warn!("Startup update check failed: {error}"),
        }
    }

    drop(instance);
    Ok(())
}

fn cancel_on_interrupt(coordinator: &UpdateCoordinator) {
    let cancel = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling update");
            cancel.cancel();
        }
    });
}

fn report_startup(report: &StartupReport) {
    if let Some(outcome) = &report.recovery {
        println!("Recovered interrupted update: {outcome:?}");
    }
    if report.removed_stale > 0 {
        debug!("Removed {} stale update entries", report.removed_stale);
    }
}

async fn update(
    layout: InstallLayout,
    settings: UpdateSettings,
    log: Arc<UpdateLog>,
    relaunch: bool,
) -> Result<(), AppError> {
    let instance = SingleInstance::acquire(&layout)?;
    let coordinator = UpdateCoordinator::new(layout, settings, log)?;

    report_startup(&coordinator.startup());

    cancel_on_interrupt(&coordinator);

    let (progress_tx, mut progress_rx) = mpsc::channel(32);
    let reporter = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            report_progress(&progress);
        }
    });

    let decision = coordinator.check_and_stage(Some(&progress_tx)).await;
    drop(progress_tx);
    let _ = reporter.await;

    let decision = decision?;
    print_decision(&decision);
    let UpdateDecision::Staged(payload) = decision else {
        return Ok(());
    };

    let pid = coordinator.hand_off(&payload, relaunch)?;
    println!("Installer started (pid {pid}); Kalkor will exit now.");
    drop(instance);
    Ok(())
}

fn report_progress(progress: &UpdateProgress) {
    match progress {
        UpdateProgress::Downloading { downloaded, total } if *total > 0 => {
            debug!("Downloaded {downloaded}/{total} bytes");
        }
        UpdateProgress::Downloading { downloaded, .. } => {
            debug!("Downloaded {downloaded} bytes");
        }
        UpdateProgress::Verifying => println!("Verifying download..."),
        UpdateProgress::Extracting => println!("Extracting..."),
        UpdateProgress::Staged { version } => println!("Version {version} is ready to install"),
    }
}

fn print_decision(decision: &UpdateDecision) {
    match decision {
        UpdateDecision::UpToDate { installed, latest } => {
            println!("Kalkor {installed} is up to date (latest {latest})");
        }
        UpdateDecision::Unavailable { kind, reason } => {
            println!("No update available ({}): {reason}", kind.as_str());
        }
        UpdateDecision::Available(manifest) => {
            println!("Kalkor {} is available", manifest.version);
        }
        UpdateDecision::Staged(payload) => {
            println!(
                "Kalkor {} staged at {}",
                payload.version(),
                payload.root().display()
            );
        }
    }
}
