use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::error::UpdateError;
use crate::fs_utils::remove_file_if_exists;
use crate::manifest::VersionManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Pending,
    Verified,
    Corrupt,
}

/// A fully downloaded archive and what is known about its integrity.
#[derive(Debug)]
pub struct StagedArtifact {
    pub(crate) path: PathBuf,
    pub(crate) outcome: VerificationOutcome,
}

impl StagedArtifact {
    pub(crate) fn pending(path: PathBuf) -> Self {
        Self {
            path,
            outcome: VerificationOutcome::Pending,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn outcome(&self) -> VerificationOutcome {
        self.outcome
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.outcome == VerificationOutcome::Verified
    }

    /// Delete the artifact from disk. Consumes it so a discarded artifact
    /// cannot reach the extractor.
    pub fn discard(self) {
        if let Err(error) = remove_file_if_exists(&self.path) {
            warn!(
                "Failed to remove artifact {} ({:?}): {error}",
                self.path.display(),
                self.outcome
            );
        }
    }
}

/// Hex SHA-256 of a file, read in fixed-size chunks.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, UpdateError> {
    let mut file = std::fs::File::open(path).map_err(|error| {
        UpdateError::io_with_path("failed to open file for checksum", path, &error)
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer).map_err(|error| {
            UpdateError::io_with_path("failed to read file for checksum", path, &error)
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a downloaded artifact against the manifest's size and digest.
///
/// A mismatch deletes the artifact before returning, so a corrupt or
/// tampered archive never survives verification.
///
/// # Errors
/// `SizeMismatch` or `ChecksumMismatch` (both `IntegrityError`), or `Disk`
/// when the file cannot be read.
pub fn verify_artifact(
    mut artifact: StagedArtifact,
    manifest: &VersionManifest,
) -> Result<StagedArtifact, UpdateError> {
    match check_integrity(&artifact.path, manifest) {
        Ok(()) => {
            info!("Update checksum verified for {}", artifact.path.display());
            artifact.outcome = VerificationOutcome::Verified;
            Ok(artifact)
        }
        Err(error) => {
            artifact.outcome = VerificationOutcome::Corrupt;
            warn!("Discarding artifact {}: {error}", artifact.path.display());
            artifact.discard();
            Err(error)
        }
    }
}

fn check_integrity(path: &Path, manifest: &VersionManifest) -> Result<(), UpdateError> {
    if let Some(expected) = manifest.archive_size {
        let actual = std::fs::metadata(path)
            .map_err(|error| UpdateError::io_with_path("failed to stat artifact", path, &error))?
            .len();
        if actual != expected {
            return Err(UpdateError::SizeMismatch { expected, actual });
        }
    }

    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(&manifest.archive_hash) {
        Ok(())
    } else {
        Err(UpdateError::ChecksumMismatch {
            expected: manifest.archive_hash.to_ascii_lowercase(),
            actual,
        })
    }
}
