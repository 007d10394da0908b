use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kalkor_platform::InstallLayout;
use log::{debug, warn};
use semver::{BuildMetadata, Version};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::fs_utils::write_atomically;
use crate::manifest::VersionManifest;

/// Dotted-numeric application version.
///
/// Ordering is numeric field by field (major, minor, patch), so `1.10.0`
/// sorts after `1.9.0`. A pre-release sorts before its release; build
/// metadata is dropped on parse and never affects ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppVersion(Version);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version '{0}'")]
pub struct InvalidVersion(pub String);

impl AppVersion {
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(Version::new(major, minor, patch))
    }

    /// Version compiled into this binary.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|| Self::new(0, 0, 0))
    }

    /// Parse `1.2.3`, `v1.2.3`, `1.2` or `1`, with an optional `-pre` suffix.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        parse_semver(raw).map(|mut version| {
            version.build = BuildMetadata::EMPTY;
            Self(version)
        })
    }

    #[must_use]
    pub fn major(&self) -> u64 {
        self.0.major
    }

    #[must_use]
    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    #[must_use]
    pub fn patch(&self) -> u64 {
        self.0.patch
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AppVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidVersion(s.to_string()))
    }
}

impl TryFrom<String> for AppVersion {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppVersion> for String {
    fn from(value: AppVersion) -> Self {
        value.to_string()
    }
}

fn parse_semver(version: &str) -> Option<Version> {
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let (core, suffix) = split_semver_core_and_suffix(version);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().map(str::parse::<u64>).transpose().ok()?;
    let patch = parts.next().map(str::parse::<u64>).transpose().ok()?;

    if parts.next().is_some() {
        return None;
    }

    let normalized = match (minor, patch) {
        (None, None) => format!("{major}.0.0{suffix}"),
        (Some(minor), None) => format!("{major}.{minor}.0{suffix}"),
        (Some(minor), Some(patch)) => format!("{major}.{minor}.{patch}{suffix}"),
        (None, Some(_)) => return None,
    };

    Version::parse(&normalized).ok()
}

fn split_semver_core_and_suffix(version: &str) -> (&str, &str) {
    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    (&version[..suffix_idx], &version[suffix_idx..])
}

/// Whether the manifest describes a strictly newer release than `installed`.
///
/// Equal versions and older manifests (stale mirrors, pulled releases) both
/// yield `false`: the updater never downgrades.
#[must_use]
pub fn needs_update(installed: &AppVersion, manifest: &VersionManifest) -> bool {
    manifest.version > *installed
}

/// Persisted record of the version currently installed.
///
/// Only a committed install transaction writes it; everything else reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: AppVersion,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

impl InstalledVersion {
    /// Read the record from the installation directory.
    ///
    /// # Errors
    /// Returns an error if the record exists but cannot be read or parsed.
    pub fn read(layout: &InstallLayout) -> Result<Option<Self>, UpdateError> {
        let path = layout.installed_version_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(UpdateError::io_with_path(
                    "failed to read installed version record",
                    &path,
                    &error,
                ));
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|error| {
            UpdateError::io_with_path(
                "failed to parse installed version record",
                &path,
                &std::io::Error::new(std::io::ErrorKind::InvalidData, error),
            )
        })
    }

    /// The installed version, falling back to the compiled-in version when
    /// no usable record exists.
    #[must_use]
    pub fn read_or_current(layout: &InstallLayout) -> AppVersion {
        match Self::read(layout) {
            Ok(Some(record)) => record.version,
            Ok(None) => {
                debug!("No installed version record, using built-in version");
                AppVersion::current()
            }
            Err(error) => {
                warn!("Ignoring unreadable installed version record: {error}");
                AppVersion::current()
            }
        }
    }

    pub(crate) fn write(layout: &InstallLayout, version: &AppVersion) -> Result<(), UpdateError> {
        let record = Self {
            version: version.clone(),
            installed_at: Some(Utc::now()),
        };
        let content = serde_json::to_vec_pretty(&record).map_err(|error| {
            UpdateError::io(
                "failed to serialize installed version record",
                std::io::Error::other(error),
            )
        })?;
        write_atomically(&layout.installed_version_file(), &content).map_err(|error| {
            UpdateError::io_with_path(
                "failed to write installed version record",
                &layout.installed_version_file(),
                &error,
            )
        })
    }
}
