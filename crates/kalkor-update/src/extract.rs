use std::path::{Path, PathBuf};

use kalkor_platform::{APP_BINARY, INSTALLER_BINARY, MANIFEST_COPY};
use log::{debug, info};

use crate::error::UpdateError;
use crate::fs_utils::{list_files_recursive, remove_dir_if_exists};
use crate::manifest::VersionManifest;
use crate::verify::StagedArtifact;
use crate::version::AppVersion;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Unpacked release, staged outside the live installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPayload {
    root: PathBuf,
    version: AppVersion,
    files: Vec<PathBuf>,
}

impl ExtractedPayload {
    /// Validate an already extracted payload directory.
    ///
    /// # Errors
    /// `PayloadIncomplete` when a required binary is missing or the manifest
    /// copy is unreadable, `PayloadVersionMismatch` when the manifest copy
    /// names another version, `Disk` when the directory cannot be listed.
    pub fn open(root: impl Into<PathBuf>, version: &AppVersion) -> Result<Self, UpdateError> {
        let root = root.into();
        let files = list_files_recursive(&root).map_err(|error| {
            UpdateError::io_with_path("failed to list payload", &root, &error)
        })?;

        let missing: Vec<String> = [APP_BINARY, INSTALLER_BINARY]
            .into_iter()
            .filter(|required| !files.iter().any(|file| file == Path::new(required)))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(UpdateError::PayloadIncomplete { missing });
        }

        let manifest_copy = root.join(MANIFEST_COPY);
        if manifest_copy.is_file() {
            let bytes = std::fs::read(&manifest_copy).map_err(|error| {
                UpdateError::io_with_path("failed to read manifest copy", &manifest_copy, &error)
            })?;
            let copy = VersionManifest::parse(&bytes).map_err(|reason| {
                debug!("Unreadable manifest copy: {reason}");
                UpdateError::PayloadIncomplete {
                    missing: vec![format!("a valid {MANIFEST_COPY}")],
                }
            })?;
            if copy.version != *version {
                return Err(UpdateError::PayloadVersionMismatch {
                    expected: version.to_string(),
                    found: copy.version.to_string(),
                });
            }
        }

        Ok(Self {
            root,
            version: version.clone(),
            files,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn version(&self) -> &AppVersion {
        &self.version
    }

    /// Files that are swapped into the live installation. The manifest copy
    /// is metadata and stays behind.
    pub fn install_files(&self) -> impl Iterator<Item = &Path> {
        self.files
            .iter()
            .map(PathBuf::as_path)
            .filter(|file| *file != Path::new(MANIFEST_COPY))
    }

    #[must_use]
    pub fn app_executable(&self) -> PathBuf {
        self.root.join(APP_BINARY)
    }

    #[must_use]
    pub fn installer_executable(&self) -> PathBuf {
        self.root.join(INSTALLER_BINARY)
    }
}

/// Unpack a verified archive into `<staging_root>/<version>`.
///
/// Extraction happens in a scratch directory that is discarded on any
/// failure; only a complete, validated payload is moved to its final name.
///
/// # Errors
/// `Unverified` for artifacts that did not pass verification,
/// `ArchiveUnsafe` for entries escaping the staging directory or symlink
/// entries, `Archive` for unreadable zips, and the payload validation errors
/// of [`ExtractedPayload::open`].
pub fn extract_payload(
    artifact: &StagedArtifact,
    staging_root: &Path,
    version: &AppVersion,
) -> Result<ExtractedPayload, UpdateError> {
    if !artifact.is_verified() {
        return Err(UpdateError::Unverified {
            path: artifact.path().to_path_buf(),
        });
    }

    std::fs::create_dir_all(staging_root).map_err(|error| {
        UpdateError::io_with_path("failed to create staging directory", staging_root, &error)
    })?;
    let scratch = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(staging_root)
        .map_err(|error| UpdateError::io("failed to create extraction directory", error))?;

    extract_zip(artifact.path(), scratch.path())?;
    let content_root = unwrap_single_directory(scratch.path())?;
    ExtractedPayload::open(&content_root, version)?;

    let final_dir = staging_root.join(version.to_string());
    remove_dir_if_exists(&final_dir).map_err(|error| {
        UpdateError::io_with_path("failed to clear previous staging", &final_dir, &error)
    })?;
    std::fs::rename(&content_root, &final_dir).map_err(|error| {
        UpdateError::io_with_path("failed to move payload into staging", &final_dir, &error)
    })?;
    drop(scratch);

    info!("Staged version {version} at {}", final_dir.display());
    ExtractedPayload::open(final_dir, version)
}

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = std::fs::File::open(zip_path).map_err(|error| {
        UpdateError::io_with_path("failed to open zip file", zip_path, &error)
    })?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| UpdateError::zip("failed to read zip archive", error))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|error| UpdateError::zip("failed to read zip entry", error))?;
        let Some(name) = entry.enclosed_name() else {
            return Err(UpdateError::ArchiveUnsafe {
                entry: entry.name().to_string(),
            });
        };
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(UpdateError::ArchiveUnsafe {
                entry: entry.name().to_string(),
            });
        }
        let out_path = dest.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                UpdateError::io_with_path("failed to create extraction directory", &out_path, &error)
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                UpdateError::io_with_path(
                    "failed to create extraction parent directory",
                    parent,
                    &error,
                )
            })?;
        }
        let mut outfile = std::fs::File::create(&out_path).map_err(|error| {
            UpdateError::io_with_path("failed to create extracted file", &out_path, &error)
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            UpdateError::io_with_path("failed to extract archive entry", &out_path, &error)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = entry.unix_mode().map_or(0o644, |mode| mode & 0o777);
            let mode = if is_binary_name(&out_path) { mode | 0o755 } else { mode };
            if let Err(error) =
                std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))
            {
                log::warn!(
                    "Failed to set mode {mode:o} on {}: {error}",
                    out_path.display()
                );
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}

#[cfg(unix)]
fn is_binary_name(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name == APP_BINARY || name == INSTALLER_BINARY)
}

/// Release archives may wrap everything in one top-level folder.
fn unwrap_single_directory(dir: &Path) -> Result<PathBuf, UpdateError> {
    let entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|error| UpdateError::io_with_path("failed to read extract dir", dir, &error))?
        .filter_map(Result::ok)
        .collect();

    match entries.as_slice() {
        [only] if only.file_type().is_ok_and(|kind| kind.is_dir()) => Ok(only.path()),
        _ => Ok(dir.to_path_buf()),
    }
}
