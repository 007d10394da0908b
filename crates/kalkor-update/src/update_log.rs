use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

/// Append-only, human-readable record of every update step.
///
/// One line per event: `[<rfc3339 utc>] <LEVEL> <message>`. Writing never
/// fails from the caller's point of view; I/O errors are dropped so logging
/// cannot change the outcome of an update. Each record is mirrored to the
/// `log` facade.
#[derive(Debug)]
pub struct UpdateLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl UpdateLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = open_append(&path).ok();
        Self {
            path: Some(path),
            file: Mutex::new(file),
        }
    }

    /// A log that only forwards to the `log` facade.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl Display) {
        log::info!("{message}");
        self.append("INFO", &message);
    }

    pub fn error(&self, message: impl Display) {
        log::warn!("{message}");
        self.append("ERROR", &message);
    }

    fn append(&self, level: &str, message: &dyn Display) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format!(
            "[{}] {level} {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if guard.is_none() || !path.exists() {
            *guard = open_append(path).ok();
        }
        if let Some(file) = guard.as_mut() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
