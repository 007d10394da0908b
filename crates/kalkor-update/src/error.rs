use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure classes of the staging pipeline.
///
/// Callers branch on the class rather than on individual variants: manifest
/// failures mean "no update available", network failures may be retried,
/// everything else is abandoned until the next check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    ManifestMalformed,
    ManifestUnreachable,
    Disk,
    Integrity,
    ArchiveUnsafe,
    ArchivePayloadIncomplete,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NetworkError",
            Self::ManifestMalformed => "ManifestMalformed",
            Self::ManifestUnreachable => "ManifestUnreachable",
            Self::Disk => "DiskError",
            Self::Integrity => "IntegrityError",
            Self::ArchiveUnsafe => "ArchiveUnsafe",
            Self::ArchivePayloadIncomplete => "ArchivePayloadIncomplete",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("{context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("download from {url} failed with HTTP {status}")]
    DownloadStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("manifest at {url} responded with HTTP {status}")]
    ManifestUnreachable {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("manifest at {url} is malformed: {reason}")]
    ManifestMalformed { url: String, reason: String },
    #[error("{context}: {source}")]
    Disk {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "not enough free space in {}: need {required} bytes, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("archive checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("archive size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("refusing to extract unverified artifact {}", path.display())]
    Unverified { path: PathBuf },
    #[error("archive entry '{entry}' escapes the staging directory")]
    ArchiveUnsafe { entry: String },
    #[error("{context}: {source}")]
    Archive {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("release payload is missing {}", missing.join(", "))]
    PayloadIncomplete { missing: Vec<String> },
    #[error("release payload declares version {found}, expected {expected}")]
    PayloadVersionMismatch { expected: String, found: String },
}

impl UpdateError {
    pub(crate) fn http(context: &'static str, source: reqwest::Error) -> Self {
        Self::Network { context, source }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Disk { context, source }
    }

    pub(crate) fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }

    pub(crate) fn zip(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Archive { context, source }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } | Self::DownloadStatus { .. } => ErrorKind::Network,
            Self::ManifestUnreachable { .. } => ErrorKind::ManifestUnreachable,
            Self::ManifestMalformed { .. } => ErrorKind::ManifestMalformed,
            Self::Disk { .. } | Self::InsufficientSpace { .. } => ErrorKind::Disk,
            Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. } | Self::Unverified { .. } => {
                ErrorKind::Integrity
            }
            Self::ArchiveUnsafe { .. } | Self::Archive { .. } => ErrorKind::ArchiveUnsafe,
            Self::PayloadIncomplete { .. } | Self::PayloadVersionMismatch { .. } => {
                ErrorKind::ArchivePayloadIncomplete
            }
        }
    }

    /// Only transient network failures are worth retrying; a corrupt or
    /// malformed release stays corrupt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Manifest failures degrade to "no update available".
    #[must_use]
    pub fn means_no_update(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ManifestMalformed | ErrorKind::ManifestUnreachable
        )
    }
}
