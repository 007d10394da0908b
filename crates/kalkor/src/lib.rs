//! Application host for Kalkor's self-update subsystem.
//!
//! Wires settings, logging and the single-instance lock to the update
//! pipeline in `kalkor-update`, and hands staged releases to the external
//! installer.

pub mod coordinator;
pub mod error;
pub mod settings;
pub mod single_instance;

pub use coordinator::{StartupReport, UpdateCoordinator, UpdateDecision};
pub use error::AppError;
pub use settings::UpdateSettings;
pub use single_instance::SingleInstance;
