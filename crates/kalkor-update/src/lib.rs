//! Self-update machinery for Kalkor.
//!
//! The application side fetches the release manifest, decides whether an
//! update is due, downloads and verifies the archive and extracts it into a
//! staging directory. The installer side, running as its own process, swaps
//! the staged files into the live installation as a journaled transaction
//! that can always be rolled back.
//!
//! - [`manifest`]: manifest model and fetch helpers.
//! - [`version`]: version parsing, comparison and the installed-version record.
//! - [`download`], [`verify`], [`extract`]: the staging pipeline.
//! - [`install`], [`recovery`]: the installer state machine and crash recovery.
//! - [`update_log`]: the append-only update log.

pub mod download;
pub mod error;
pub mod extract;
mod fs_utils;
pub mod install;
pub mod launch;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod pipeline;
pub mod recovery;
pub mod transaction;
pub mod update_log;
pub mod verify;
pub mod version;

/// Error taxonomy shared by the staging pipeline.
pub use error::{ErrorKind, UpdateError};
/// Staged payload produced by the extractor.
pub use extract::{ExtractedPayload, extract_payload};
/// Installer entry points and exit-code mapping.
pub use install::{InstallError, InstallReport, InstallRequest, Installer};
/// Installer hand-off from the application.
pub use launch::{LaunchOptions, launch_installer, relaunch_app};
/// Application and installer locks.
pub use lock::{AppLock, InstallLock};
/// Manifest model and fetch helpers.
pub use manifest::{VersionManifest, build_http_client, fetch_manifest, fetch_manifest_from_mirrors};
/// Application-side check and staging flow.
pub use pipeline::{CheckOutcome, UpdateProgress, check_for_update, stage_update};
/// Crash recovery for interrupted install transactions.
pub use recovery::{RecoveryOutcome, cleanup_stale_staging, recover};
/// Install transaction states.
pub use transaction::InstallState;
/// Append-only update log.
pub use update_log::UpdateLog;
/// Downloaded archive and its verification outcome.
pub use verify::{StagedArtifact, VerificationOutcome};
/// Version model and comparator.
pub use version::{AppVersion, InstalledVersion, needs_update};
