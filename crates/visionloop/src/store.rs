//! Persisted camera/pipeline document and where it lives.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::camera::CameraSettings;
use crate::config::RuntimeConfig;
use crate::error::{Result, VisionError};
use crate::pipeline::PipelineRecord;

/// Schema version of the decoupled camera/pipeline document
pub const CURRENT_VERSION: u32 = 2;

/// Decoupled document: cameras and pipelines persisted side by side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub version: u32,
    #[serde(default)]
    pub cameras: Vec<CameraSettings>,
    #[serde(default)]
    pub pipelines: Vec<PipelineRecord>,
    #[serde(default = "default_next_id")]
    pub next_pipeline_id: u32,
}

fn default_next_id() -> u32 {
    1
}

impl Default for PersistedDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cameras: Vec::new(),
            pipelines: Vec::new(),
            next_pipeline_id: 1,
        }
    }
}

impl PersistedDocument {
    /// Parse a current-version document.
    pub fn parse(text: &str) -> Result<Self> {
        let doc: Self = serde_yaml::from_str(text)?;
        if doc.version != CURRENT_VERSION {
            return Err(VisionError::Parse(format!(
                "expected document version {}, found {}",
                CURRENT_VERSION, doc.version
            )));
        }
        Ok(doc)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Schema version of a persisted blob.
///
/// Blobs without a `version` key predate versioning and count as version 1.
/// Returns `None` for an empty blob.
pub fn detect_version(text: &str) -> Result<Option<u32>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    if value.is_null() {
        return Ok(None);
    }
    let Some(map) = value.as_mapping() else {
        return Err(VisionError::Parse("document is not a mapping".to_string()));
    };
    match map.get("version") {
        None => Ok(Some(1)),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| VisionError::Parse(format!("invalid version marker: {:?}", v))),
    }
}

/// Storage of the persisted document and its pre-migration backup.
///
/// Blobs are stored and returned verbatim.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, blob: &str) -> Result<()>;
    fn load_backup(&self) -> Result<Option<String>>;
    fn save_backup(&self, blob: &str) -> Result<()>;
}

/// Document and backup as YAML files under the data directory
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    document: PathBuf,
    backup: PathBuf,
}

impl FileConfigStore {
    pub fn new(document: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        Self {
            document: document.into(),
            backup: backup.into(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.document_path(), config.backup_path())
    }

    pub fn document_path(&self) -> &Path {
        &self.document
    }

    fn read(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Write through a temporary file so readers never see a torn document.
    fn write(path: &Path, blob: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Option<String>> {
        Self::read(&self.document)
    }

    fn save(&self, blob: &str) -> Result<()> {
        Self::write(&self.document, blob)
            .map_err(|e| VisionError::Persistence(format!("{}: {}", self.document.display(), e)))
    }

    fn load_backup(&self) -> Result<Option<String>> {
        Self::read(&self.backup).map_err(|e| {
            VisionError::BackupUnreadable(format!("{}: {}", self.backup.display(), e))
        })
    }

    fn save_backup(&self, blob: &str) -> Result<()> {
        Self::write(&self.backup, blob)
            .map_err(|e| VisionError::Persistence(format!("{}: {}", self.backup.display(), e)))
    }
}

/// In-memory store with save-failure injection
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    document: Mutex<Option<String>>,
    backup: Mutex<Option<String>>,
    failing_saves: AtomicU32,
    saves: AtomicU32,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(blob: impl Into<String>) -> Self {
        let store = Self::default();
        *lock(&store.document) = Some(blob.into());
        store
    }

    /// Fail the next `count` document saves
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::Release);
    }

    /// Successful document saves so far
    pub fn save_count(&self) -> u32 {
        self.saves.load(Ordering::Acquire)
    }

    pub fn document(&self) -> Option<String> {
        lock(&self.document).clone()
    }

    pub fn backup(&self) -> Option<String> {
        lock(&self.backup).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.document())
    }

    fn save(&self, blob: &str) -> Result<()> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(VisionError::Persistence("injected save failure".to_string()));
        }
        *lock(&self.document) = Some(blob.to_string());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn load_backup(&self) -> Result<Option<String>> {
        Ok(self.backup())
    }

    fn save_backup(&self, blob: &str) -> Result<()> {
        *lock(&self.backup) = Some(blob.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineId, PipelineSettings};

    #[test]
    fn test_detect_version() {
        assert_eq!(detect_version("").unwrap(), None);
        assert_eq!(detect_version("cameras: []").unwrap(), Some(1));
        assert_eq!(detect_version("version: 2\ncameras: []").unwrap(), Some(2));
        assert!(detect_version("version: two").is_err());
        assert!(detect_version("- a\n- b").is_err());
    }

    #[test]
    fn test_document_roundtrip_keeps_ids() {
        let doc = PersistedDocument {
            cameras: vec![CameraSettings::new("Cam0").with_stream_index(0)],
            pipelines: vec![PipelineRecord {
                id: PipelineId(3),
                settings: PipelineSettings::new("p", "Cam0").with_param("threshold", 120),
            }],
            next_pipeline_id: 4,
            ..Default::default()
        };
        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.contains("source_camera_unique_name: Cam0"));
        assert_eq!(PersistedDocument::parse(&yaml).unwrap(), doc);
    }

    #[test]
    fn test_parse_rejects_other_versions() {
        assert!(PersistedDocument::parse("version: 1\ncameras: []").is_err());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(
            dir.path().join("nested/cameras.yaml"),
            dir.path().join("nested/cameras.yaml.bak"),
        );
        assert_eq!(store.load().unwrap(), None);
        assert_eq!(store.load_backup().unwrap(), None);

        store.save("version: 2\n").unwrap();
        store.save_backup("cameras: []\n").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("version: 2\n"));
        assert_eq!(store.load_backup().unwrap().as_deref(), Some("cameras: []\n"));
        assert!(!dir.path().join("nested/cameras.yaml.tmp").exists());
    }

    #[test]
    fn test_memory_store_injected_failure() {
        let store = MemoryConfigStore::with_document("a");
        store.fail_next_saves(1);
        assert!(store.save("b").is_err());
        assert_eq!(store.document().as_deref(), Some("a"));
        store.save("c").unwrap();
        assert_eq!(store.document().as_deref(), Some("c"));
        assert_eq!(store.save_count(), 1);
    }
}
