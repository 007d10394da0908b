use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use simplelog::{CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

/// Diagnostic log sink that reopens its file when it disappears, e.g. after
/// the user clears the log directory while Kalkor or the installer runs.
struct ReopeningFile {
    path: PathBuf,
    file: Option<File>,
}

impl ReopeningFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() || !self.path.exists() {
            self.file = Some(open_append(&self.path)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("diagnostic log unavailable"))
    }
}

impl Write for ReopeningFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Cut an oversized log down to its newest `max_size / 2` bytes, starting at
/// a line boundary.
fn truncate_to_recent(path: &Path, max_size: u64) {
    let Ok(contents) = std::fs::read(path) else {
        return;
    };
    let len = contents.len() as u64;
    if len <= max_size {
        return;
    }
    let cut = usize::try_from(len - max_size / 2).unwrap_or(contents.len());
    let start = contents[cut..]
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(contents.len(), |offset| cut + offset + 1);
    let _ = std::fs::write(path, &contents[start..]);
}

fn log_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Error)
        .add_filter_allow_str("kalkor")
        .build()
}

/// Install the process-wide diagnostic logger writing to `log_path`.
///
/// Used by both the application and the installer; only `kalkor*` targets
/// are recorded. Debug builds also log to the terminal. A second call keeps
/// the first logger and only adjusts the level.
pub fn init_logging(log_path: &Path, debug_enabled: bool, max_log_size: u64) {
    truncate_to_recent(log_path, max_log_size);

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(simplelog::TermLogger::new(
        LevelFilter::Debug,
        log_config(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    ));
    match ReopeningFile::open(log_path.to_path_buf()) {
        Ok(sink) => loggers.push(WriteLogger::new(LevelFilter::Debug, log_config(), sink)),
        Err(error) => eprintln!("Diagnostic log {} unavailable: {error}", log_path.display()),
    }

    if !loggers.is_empty() {
        let _ = CombinedLogger::init(loggers);
    }
    set_debug_logging(debug_enabled);
    log::debug!("Diagnostic log at {}", log_path.display());
}

/// Switch between `Debug` and `Info`. Update steps are logged at `Info`, so
/// they stay on record either way.
pub fn set_debug_logging(enabled: bool) {
    log::set_max_level(if enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}
