//! Schema migration of the persisted camera/pipeline document.
//!
//! Version 1 stored pipelines inside their camera, each carrying a copy of the
//! hardware settings. Version 2 stores cameras and pipelines side by side with
//! pipelines referencing cameras by name.

pub mod legacy;
mod migrator;

pub use migrator::{ConfigMigrator, MigrationOutcome, MigrationState};
