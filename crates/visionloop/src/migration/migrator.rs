use serde::Serialize;
use std::sync::{Arc, Mutex};

use super::legacy;
use crate::error::{MigrationError, Result, VisionError};
use crate::store::{detect_version, ConfigStore, CURRENT_VERSION};

/// Where the persisted document stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Unmigrated,
    Migrating,
    Migrated,
    MigrationFailed,
    RolledBack,
}

/// What a migration run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No document exists yet
    Fresh,
    /// The document already carries the current version; nothing was written
    AlreadyCurrent,
    Migrated { cameras: usize, pipelines: usize },
    /// The document was unreadable and has been rebuilt from the backup
    Repaired { cameras: usize, pipelines: usize },
}

#[derive(Debug)]
struct Status {
    state: MigrationState,
    last_error: Option<String>,
}

/// Moves the persisted document from the legacy schema to the current one.
///
/// A full backup is written before anything else; the version marker only
/// lands with the final save. Any failure restores the backup verbatim.
pub struct ConfigMigrator {
    store: Arc<dyn ConfigStore>,
    status: Mutex<Status>,
}

impl ConfigMigrator {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            status: Mutex::new(Status {
                state: MigrationState::Unmigrated,
                last_error: None,
            }),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.lock().state
    }

    /// Reason of the last failed migration or rollback
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, state: MigrationState) {
        let mut status = self.lock();
        log::debug!("Migration state {:?} -> {:?}", status.state, state);
        status.state = state;
        if state == MigrationState::Migrated {
            status.last_error = None;
        }
    }

    fn fail(&self, reason: String) {
        let mut status = self.lock();
        status.state = MigrationState::MigrationFailed;
        status.last_error = Some(reason);
    }

    /// Bring the persisted document to the current schema.
    ///
    /// Running it on a current document is a no-op. A per-unit failure rolls
    /// the document back and is returned as `VisionError::Migration`.
    pub fn run(&self) -> Result<MigrationOutcome> {
        let Some(blob) = self.store.load()? else {
            self.set(MigrationState::Migrated);
            return Ok(MigrationOutcome::Fresh);
        };

        let version = match detect_version(&blob) {
            Ok(Some(version)) => version,
            Ok(None) => {
                self.set(MigrationState::Migrated);
                return Ok(MigrationOutcome::Fresh);
            }
            Err(e) => return self.repair(e),
        };

        if version >= CURRENT_VERSION {
            if version > CURRENT_VERSION {
                return Err(VisionError::Parse(format!(
                    "document version {} is newer than supported version {}",
                    version, CURRENT_VERSION
                )));
            }
            self.set(MigrationState::Migrated);
            log::debug!("Document already at version {}", version);
            return Ok(MigrationOutcome::AlreadyCurrent);
        }

        let (cameras, pipelines) = self.migrate(&blob)?;
        Ok(MigrationOutcome::Migrated { cameras, pipelines })
    }

    /// Migrate a legacy blob; the backup is taken before any change.
    fn migrate(&self, blob: &str) -> Result<(usize, usize)> {
        log::info!("Migrating camera configuration to version {}", CURRENT_VERSION);
        self.set(MigrationState::Migrating);
        if let Err(e) = self.store.save_backup(blob) {
            // Nothing was touched yet
            self.fail(e.to_string());
            return Err(e);
        }

        let doc = match legacy::convert(blob) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("Migration failed at {}", e);
                self.fail(e.to_string());
                self.restore()?;
                return Err(VisionError::Migration(e));
            }
        };

        let saved = doc.to_yaml().and_then(|yaml| self.store.save(&yaml));
        if let Err(e) = saved {
            log::error!("Failed to write migrated document: {}", e);
            self.fail(e.to_string());
            self.restore()?;
            return Err(VisionError::Migration(MigrationError {
                unit: doc.cameras.len(),
                camera: String::new(),
                reason: e.to_string(),
            }));
        }

        self.set(MigrationState::Migrated);
        log::info!(
            "Migrated {} cameras and {} pipelines",
            doc.cameras.len(),
            doc.pipelines.len()
        );
        Ok((doc.cameras.len(), doc.pipelines.len()))
    }

    /// Put the backup back in place, byte for byte.
    fn restore(&self) -> Result<()> {
        let backup = self
            .store
            .load_backup()?
            .ok_or_else(|| VisionError::BackupUnreadable("backup missing".to_string()))?;
        self.store.save(&backup)?;
        self.set(MigrationState::RolledBack);
        log::warn!("Configuration restored from backup");
        Ok(())
    }

    /// The document does not parse: rebuild it from the backup when one exists.
    fn repair(&self, err: VisionError) -> Result<MigrationOutcome> {
        let Some(backup) = self.store.load_backup()? else {
            self.fail(err.to_string());
            return Err(err);
        };
        log::warn!("Configuration unreadable ({}), replaying from backup", err);
        match detect_version(&backup) {
            Ok(Some(version)) if version < CURRENT_VERSION => {}
            _ => {
                return Err(VisionError::BackupUnreadable(
                    "backup is not a legacy document".to_string(),
                ))
            }
        }
        self.store.save(&backup)?;
        let (cameras, pipelines) = self.migrate(&backup)?;
        Ok(MigrationOutcome::Repaired { cameras, pipelines })
    }

    /// Restore the pre-migration document on demand.
    pub fn rollback(&self) -> Result<()> {
        log::info!("Rolling back camera configuration");
        if let Err(e) = self.restore() {
            self.lock().last_error = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConfigStore, PersistedDocument};

    const LEGACY: &str = "cameras:\n  - unique_name: Cam0\n    pipelines:\n      - nickname: P1\n        settings: {exposure: 30, threshold: 10}\n";

    fn migrator(store: &Arc<MemoryConfigStore>) -> ConfigMigrator {
        ConfigMigrator::new(store.clone())
    }

    #[test]
    fn test_fresh_store() {
        let store = Arc::new(MemoryConfigStore::new());
        let migrator = migrator(&store);
        assert_eq!(migrator.state(), MigrationState::Unmigrated);
        assert_eq!(migrator.run().unwrap(), MigrationOutcome::Fresh);
        assert_eq!(migrator.state(), MigrationState::Migrated);
        assert!(store.document().is_none());
    }

    #[test]
    fn test_migrate_writes_backup_and_version() {
        let store = Arc::new(MemoryConfigStore::with_document(LEGACY));
        let migrator = migrator(&store);
        assert_eq!(
            migrator.run().unwrap(),
            MigrationOutcome::Migrated {
                cameras: 1,
                pipelines: 1
            }
        );
        assert_eq!(store.backup().as_deref(), Some(LEGACY));
        let doc = PersistedDocument::parse(&store.document().unwrap()).unwrap();
        assert_eq!(doc.cameras[0].hardware.exposure, 30.0);
    }

    #[test]
    fn test_second_run_is_noop() {
        let store = Arc::new(MemoryConfigStore::with_document(LEGACY));
        migrator(&store).run().unwrap();
        let migrated = store.document();
        let saves = store.save_count();

        assert_eq!(migrator(&store).run().unwrap(), MigrationOutcome::AlreadyCurrent);
        assert_eq!(store.document(), migrated);
        assert_eq!(store.save_count(), saves);
    }

    #[test]
    fn test_failed_unit_restores_backup() {
        let blob = format!("{}  - unique_name: Cam1\n    pipelines:\n      - settings: {{gain: lots}}\n", LEGACY);
        let store = Arc::new(MemoryConfigStore::with_document(blob.clone()));
        let migrator = migrator(&store);

        let err = migrator.run().unwrap_err();
        assert!(matches!(err, VisionError::Migration(ref e) if e.unit == 1));
        assert_eq!(migrator.state(), MigrationState::RolledBack);
        assert!(migrator.last_error().unwrap().contains("gain"));
        assert_eq!(store.document().as_deref(), Some(blob.as_str()));
    }

    #[test]
    fn test_failed_save_restores_backup() {
        let store = Arc::new(MemoryConfigStore::with_document(LEGACY));
        store.fail_next_saves(1);
        let migrator = migrator(&store);
        assert!(matches!(migrator.run(), Err(VisionError::Migration(_))));
        assert_eq!(migrator.state(), MigrationState::RolledBack);
        assert_eq!(store.document().as_deref(), Some(LEGACY));
    }

    #[test]
    fn test_rollback_restores_legacy_document() {
        let store = Arc::new(MemoryConfigStore::with_document(LEGACY));
        let migrator = migrator(&store);
        migrator.run().unwrap();
        migrator.rollback().unwrap();
        assert_eq!(migrator.state(), MigrationState::RolledBack);
        assert_eq!(store.document().as_deref(), Some(LEGACY));
    }

    #[test]
    fn test_rollback_without_backup_fails() {
        let store = Arc::new(MemoryConfigStore::with_document("version: 2\n"));
        let migrator = migrator(&store);
        assert!(matches!(migrator.rollback(), Err(VisionError::BackupUnreadable(_))));
    }

    #[test]
    fn test_unparsable_document_repaired_from_backup() {
        let store = Arc::new(MemoryConfigStore::with_document(LEGACY));
        migrator(&store).run().unwrap();
        store.save("cameras: [unterminated").unwrap();

        let migrator = migrator(&store);
        assert_eq!(
            migrator.run().unwrap(),
            MigrationOutcome::Repaired {
                cameras: 1,
                pipelines: 1
            }
        );
        assert_eq!(migrator.state(), MigrationState::Migrated);
        assert!(PersistedDocument::parse(&store.document().unwrap()).is_ok());
    }

    #[test]
    fn test_unparsable_document_without_backup_is_fatal() {
        let store = Arc::new(MemoryConfigStore::with_document("cameras: [unterminated"));
        let migrator = migrator(&store);
        assert!(matches!(migrator.run(), Err(VisionError::Parse(_))));
        assert_eq!(migrator.state(), MigrationState::MigrationFailed);
    }
}
