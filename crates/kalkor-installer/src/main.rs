mod cli;

use std::process::ExitCode;

use clap::Parser;
use kalkor_update::UpdateLog;
use kalkor_update::logging::init_logging;

use crate::cli::{Cli, Completed};

const MAX_DEBUG_LOG_SIZE: u64 = 5 * 1024 * 1024;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = cli.mode().unwrap_or_else(|error| error.exit());

    init_logging(&cli.debug_log_path(), cli.debug, MAX_DEBUG_LOG_SIZE);
    let log = UpdateLog::open(&cli.log);

    match cli::run(&cli, mode, &log) {
        Ok(Completed::Installed(version)) => {
            log::info!("Installed version {version}");
            ExitCode::SUCCESS
        }
        Ok(Completed::Recovered(outcome)) => {
            log.info(format!("recovery finished: {outcome:?}"));
            ExitCode::SUCCESS
        }
        Err(error) => {
            log.error(format!(
                "installer exiting with {} ({}): {error}",
                error.exit_code(),
                error.name()
            ));
            ExitCode::from(error.exit_code())
        }
    }
}
