//! Pipeline registry
//!
//! Pipelines reference cameras by name only. While a pipeline is claimed by
//! a camera cycle its edits are queued and applied when the cycle releases
//! it, so a frame is never processed with half-applied settings or by a
//! pipeline that moved to another camera mid-cycle.

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::Mapping;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use super::settings::{check_no_hardware_fields, PipelineRecord, PipelineSettings};
use super::PipelineId;
use crate::camera::CameraReferences;
use crate::error::{Result, VisionError};

/// Run state reported for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Enabled and its camera resolves
    Running,
    /// Enabled but its camera does not currently resolve
    Paused,
    Disabled,
}

/// Read-only snapshot of a pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineView {
    pub id: PipelineId,
    pub settings: PipelineSettings,
    pub state: RunState,
    /// Sequence number of the last frame this pipeline finished
    pub last_sequence: Option<u64>,
    /// Consecutive cycles in which the pipeline missed its deadline
    pub missed_deadlines: u32,
    /// True while edits wait for the current cycle to finish
    pub edits_pending: bool,
}

#[derive(Debug, Clone)]
enum PendingEdit {
    SetSource(String),
    SetEnabled(bool),
    SetParams(Mapping),
    Rename(String),
    Delete,
}

impl PendingEdit {
    fn apply(self, settings: &mut PipelineSettings) {
        match self {
            PendingEdit::SetSource(name) => settings.source_camera_unique_name = name,
            PendingEdit::SetEnabled(enabled) => settings.enabled = enabled,
            PendingEdit::SetParams(params) => settings.params = params,
            PendingEdit::Rename(nickname) => settings.nickname = nickname,
            PendingEdit::Delete => {}
        }
    }
}

#[derive(Debug)]
struct PipelineEntry {
    settings: PipelineSettings,
    /// Camera cycle currently holding this pipeline
    claimed_by: Option<(String, u64)>,
    pending: Vec<PendingEdit>,
    last_sequence: Option<u64>,
    missed_deadlines: u32,
}

impl PipelineEntry {
    fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            claimed_by: None,
            pending: Vec::new(),
            last_sequence: None,
            missed_deadlines: 0,
        }
    }

    fn delete_pending(&self) -> bool {
        self.pending.iter().any(|e| matches!(e, PendingEdit::Delete))
    }

    /// Settings as they will be once pending edits land
    fn effective(&self) -> PipelineSettings {
        let mut settings = self.settings.clone();
        for edit in &self.pending {
            edit.clone().apply(&mut settings);
        }
        settings
    }

    fn view(&self, id: PipelineId, cameras: &HashSet<String>) -> PipelineView {
        let settings = self.effective();
        let state = if !settings.enabled {
            RunState::Disabled
        } else if cameras.contains(&settings.source_camera_unique_name) {
            RunState::Running
        } else {
            RunState::Paused
        };
        PipelineView {
            id,
            settings,
            state,
            last_sequence: self.last_sequence,
            missed_deadlines: self.missed_deadlines,
            edits_pending: !self.pending.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    pipelines: BTreeMap<PipelineId, PipelineEntry>,
    next_id: u32,
}

impl RegistryState {
    /// Build from persisted records, skipping the ones that cannot be loaded.
    fn from_records(records: Vec<PipelineRecord>, next_id: u32) -> Self {
        let mut state = RegistryState {
            pipelines: BTreeMap::new(),
            next_id,
        };
        for record in records {
            // Ids are never reused, skipped ones included
            state.next_id = state.next_id.max(record.id.0 + 1);
            if let Err(e) = record.settings.validate() {
                log::warn!(
                    "Skipping pipeline {} '{}': {}",
                    record.id,
                    record.settings.nickname,
                    e
                );
                continue;
            }
            if state.pipelines.contains_key(&record.id) {
                log::warn!("Skipping pipeline {}: id already loaded", record.id);
                continue;
            }
            state
                .pipelines
                .insert(record.id, PipelineEntry::new(record.settings));
        }
        state
    }

    fn allocate_id(&mut self) -> PipelineId {
        self.next_id = self.next_id.max(1);
        let id = PipelineId(self.next_id);
        self.next_id += 1;
        id
    }

    fn live(&self, id: PipelineId) -> Result<&PipelineEntry> {
        self.pipelines
            .get(&id)
            .filter(|e| !e.delete_pending())
            .ok_or(VisionError::PipelineNotFound(id))
    }

    fn live_mut(&mut self, id: PipelineId) -> Result<&mut PipelineEntry> {
        self.pipelines
            .get_mut(&id)
            .filter(|e| !e.delete_pending())
            .ok_or(VisionError::PipelineNotFound(id))
    }

    /// Apply an edit now, or queue it if a cycle holds the pipeline.
    fn edit(&mut self, id: PipelineId, edit: PendingEdit) -> Result<()> {
        let entry = self.live_mut(id)?;
        if entry.claimed_by.is_some() {
            entry.pending.push(edit);
            return Ok(());
        }
        if matches!(edit, PendingEdit::Delete) {
            self.pipelines.remove(&id);
        } else {
            edit.apply(&mut entry.settings);
        }
        Ok(())
    }
}

/// Pipelines bound to one camera cycle
#[derive(Debug)]
pub struct CycleClaim {
    pub camera: String,
    pub sequence: u64,
    /// Settings snapshot for each bound pipeline, ascending by id
    pub bindings: Vec<(PipelineId, PipelineSettings)>,
}

impl CycleClaim {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn ids(&self) -> Vec<PipelineId> {
        self.bindings.iter().map(|(id, _)| *id).collect()
    }
}

/// Registry of every pipeline, ordered by id
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    state: RwLock<RegistryState>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from persisted records. `next_id` never goes below the
    /// highest loaded id + 1.
    pub fn from_records(records: Vec<PipelineRecord>, next_id: u32) -> Self {
        Self {
            state: RwLock::new(RegistryState::from_records(records, next_id)),
        }
    }

    /// Replace every pipeline with persisted records.
    pub async fn load(&self, records: Vec<PipelineRecord>, next_id: u32) {
        let loaded = RegistryState::from_records(records, next_id);
        log::info!("Loaded {} pipelines", loaded.pipelines.len());
        *self.state.write().await = loaded;
    }

    /// Create a pipeline reading from `source_camera`, which need not exist yet.
    pub async fn create(
        &self,
        source_camera: &str,
        mut settings: PipelineSettings,
    ) -> Result<PipelineId> {
        settings.validate()?;
        settings.source_camera_unique_name = source_camera.to_string();
        let mut state = self.state.write().await;
        let id = state.allocate_id();
        log::info!(
            "Pipeline {} '{}' created on camera '{}'",
            id,
            settings.nickname,
            source_camera
        );
        state.pipelines.insert(id, PipelineEntry::new(settings));
        Ok(id)
    }

    /// Deep-copy a pipeline, camera reference included.
    pub async fn duplicate(&self, id: PipelineId) -> Result<PipelineId> {
        let mut state = self.state.write().await;
        let mut settings = state.live(id)?.effective();
        settings.nickname = format!("{} (copy)", settings.nickname);
        let new_id = state.allocate_id();
        log::info!("Pipeline {} duplicated as {}", id, new_id);
        state.pipelines.insert(new_id, PipelineEntry::new(settings));
        Ok(new_id)
    }

    pub async fn delete(&self, id: PipelineId) -> Result<()> {
        self.state.write().await.edit(id, PendingEdit::Delete)?;
        log::info!("Pipeline {} deleted", id);
        Ok(())
    }

    /// Point a pipeline at another camera; takes effect at the next cycle boundary.
    pub async fn set_source_camera(&self, id: PipelineId, camera: &str) -> Result<()> {
        self.state
            .write()
            .await
            .edit(id, PendingEdit::SetSource(camera.to_string()))?;
        log::info!("Pipeline {} now reads from camera '{}'", id, camera);
        Ok(())
    }

    pub async fn set_enabled(&self, id: PipelineId, enabled: bool) -> Result<()> {
        self.state
            .write()
            .await
            .edit(id, PendingEdit::SetEnabled(enabled))
    }

    pub async fn update_params(&self, id: PipelineId, params: Mapping) -> Result<()> {
        check_no_hardware_fields(&params)?;
        self.state
            .write()
            .await
            .edit(id, PendingEdit::SetParams(params))
    }

    pub async fn rename(&self, id: PipelineId, nickname: &str) -> Result<()> {
        self.state
            .write()
            .await
            .edit(id, PendingEdit::Rename(nickname.to_string()))
    }

    pub async fn get(&self, id: PipelineId, cameras: &HashSet<String>) -> Result<PipelineView> {
        let state = self.state.read().await;
        Ok(state.live(id)?.view(id, cameras))
    }

    /// All pipelines ascending by id; `cameras` is the set of resolvable names.
    pub async fn list(&self, cameras: &HashSet<String>) -> Vec<PipelineView> {
        let state = self.state.read().await;
        state
            .pipelines
            .iter()
            .filter(|(_, e)| !e.delete_pending())
            .map(|(id, e)| e.view(*id, cameras))
            .collect()
    }

    /// Enabled pipelines currently referencing `camera`, ascending by id.
    pub async fn list_for_camera(&self, camera: &str) -> Vec<PipelineView> {
        let state = self.state.read().await;
        let resolved: HashSet<String> = [camera.to_string()].into_iter().collect();
        state
            .pipelines
            .iter()
            .filter(|(_, e)| !e.delete_pending())
            .map(|(id, e)| e.view(*id, &resolved))
            .filter(|v| v.settings.enabled && v.settings.source_camera_unique_name == camera)
            .collect()
    }

    /// Claim every enabled pipeline bound to `camera` for one cycle.
    ///
    /// Pipelines still held by another cycle are skipped; they join once
    /// released.
    pub async fn begin_cycle(&self, camera: &str, sequence: u64) -> CycleClaim {
        let mut state = self.state.write().await;
        let mut bindings = Vec::new();
        for (id, entry) in state.pipelines.iter_mut() {
            if entry.claimed_by.is_some()
                || !entry.settings.enabled
                || entry.settings.source_camera_unique_name != camera
            {
                continue;
            }
            entry.claimed_by = Some((camera.to_string(), sequence));
            bindings.push((*id, entry.settings.clone()));
        }
        CycleClaim {
            camera: camera.to_string(),
            sequence,
            bindings,
        }
    }

    /// Release a cycle's pipelines and apply edits queued meanwhile.
    ///
    /// `completed` lists the pipelines that produced a result for the cycle
    /// and `failed` the ones that reported an error in time; the rest count
    /// as missed deadlines.
    pub async fn end_cycle(
        &self,
        claim: CycleClaim,
        completed: &[PipelineId],
        failed: &[PipelineId],
    ) {
        let mut state = self.state.write().await;
        let mut removed = Vec::new();
        for (id, _) in claim.bindings {
            let Some(entry) = state.pipelines.get_mut(&id) else {
                continue;
            };
            if entry.claimed_by.as_ref() != Some(&(claim.camera.clone(), claim.sequence)) {
                continue;
            }
            entry.claimed_by = None;
            if completed.contains(&id) {
                entry.last_sequence = Some(claim.sequence);
                entry.missed_deadlines = 0;
            } else if failed.contains(&id) {
                entry.missed_deadlines = 0;
            } else {
                entry.missed_deadlines = entry.missed_deadlines.saturating_add(1);
            }

            for edit in std::mem::take(&mut entry.pending) {
                if matches!(edit, PendingEdit::Delete) {
                    removed.push(id);
                    break;
                }
                edit.apply(&mut entry.settings);
            }
        }
        for id in removed {
            state.pipelines.remove(&id);
        }
    }

    /// Persistable records (pending edits applied) and the next free id.
    pub async fn records(&self) -> (Vec<PipelineRecord>, u32) {
        let state = self.state.read().await;
        let records = state
            .pipelines
            .iter()
            .filter(|(_, e)| !e.delete_pending())
            .map(|(id, e)| PipelineRecord {
                id: *id,
                settings: e.effective(),
            })
            .collect();
        (records, state.next_id.max(1))
    }
}

#[async_trait]
impl CameraReferences for PipelineRegistry {
    async fn referencing(&self, camera: &str) -> Vec<PipelineId> {
        self.list_for_camera(camera)
            .await
            .into_iter()
            .map(|v| v.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cameras(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_without_camera_is_paused() {
        let registry = PipelineRegistry::new();
        let id = registry
            .create("Cam9", PipelineSettings::new("p", ""))
            .await
            .unwrap();
        assert_eq!(id, PipelineId(1));
        let view = registry.get(id, &cameras(&["Cam0"])).await.unwrap();
        assert_eq!(view.state, RunState::Paused);
        assert_eq!(view.settings.source_camera_unique_name, "Cam9");
    }

    #[tokio::test]
    async fn test_duplicate_is_independent() {
        let registry = PipelineRegistry::new();
        let id = registry
            .create("Cam0", PipelineSettings::new("p", "").with_param("threshold", 10))
            .await
            .unwrap();
        let copy = registry.duplicate(id).await.unwrap();
        assert_ne!(id, copy);

        registry.set_source_camera(copy, "Cam1").await.unwrap();
        let mut params = Mapping::new();
        params.insert("threshold".into(), 99.into());
        registry.update_params(copy, params).await.unwrap();

        let all = registry.list(&cameras(&["Cam0", "Cam1"])).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].settings.source_camera_unique_name, "Cam0");
        assert_eq!(all[0].settings.param("threshold"), Some(&10.into()));
        assert_eq!(all[1].settings.source_camera_unique_name, "Cam1");
        assert_eq!(all[1].settings.nickname, "p (copy)");
        assert_eq!(all[1].settings.param("threshold"), Some(&99.into()));
    }

    #[tokio::test]
    async fn test_list_for_camera_filters_disabled() {
        let registry = PipelineRegistry::new();
        let a = registry.create("Cam0", PipelineSettings::new("a", "")).await.unwrap();
        let b = registry.create("Cam0", PipelineSettings::new("b", "")).await.unwrap();
        registry.create("Cam1", PipelineSettings::new("c", "")).await.unwrap();
        registry.set_enabled(b, false).await.unwrap();

        let bound: Vec<_> = registry.list_for_camera("Cam0").await.iter().map(|v| v.id).collect();
        assert_eq!(bound, vec![a]);
        assert_eq!(registry.referencing("Cam0").await, vec![a]);
    }

    #[tokio::test]
    async fn test_reassociation_waits_for_cycle_boundary() {
        let registry = PipelineRegistry::new();
        let id = registry.create("Cam0", PipelineSettings::new("p", "")).await.unwrap();

        let claim = registry.begin_cycle("Cam0", 7).await;
        assert_eq!(claim.ids(), vec![id]);

        registry.set_source_camera(id, "Cam1").await.unwrap();
        // Cam1 cannot claim it while Cam0's cycle holds it
        assert!(registry.begin_cycle("Cam1", 1).await.is_empty());
        let view = registry.get(id, &cameras(&["Cam0", "Cam1"])).await.unwrap();
        assert!(view.edits_pending);
        assert_eq!(view.settings.source_camera_unique_name, "Cam1");

        registry.end_cycle(claim, &[id], &[]).await;
        let view = registry.get(id, &cameras(&["Cam0", "Cam1"])).await.unwrap();
        assert!(!view.edits_pending);
        assert_eq!(view.last_sequence, Some(7));

        assert!(registry.begin_cycle("Cam0", 8).await.is_empty());
        assert_eq!(registry.begin_cycle("Cam1", 2).await.ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_delete_during_cycle_is_deferred() {
        let registry = PipelineRegistry::new();
        let id = registry.create("Cam0", PipelineSettings::new("p", "")).await.unwrap();
        let claim = registry.begin_cycle("Cam0", 1).await;

        registry.delete(id).await.unwrap();
        assert!(registry.list(&cameras(&["Cam0"])).await.is_empty());
        assert!(matches!(
            registry.set_enabled(id, false).await,
            Err(VisionError::PipelineNotFound(_))
        ));

        registry.end_cycle(claim, &[], &[]).await;
        assert!(registry.records().await.0.is_empty());
        // Ids are not reused
        let next = registry.create("Cam0", PipelineSettings::new("q", "")).await.unwrap();
        assert_eq!(next, PipelineId(2));
    }

    #[tokio::test]
    async fn test_claimed_cycle_keeps_old_settings() {
        let registry = PipelineRegistry::new();
        let id = registry
            .create("Cam0", PipelineSettings::new("p", "").with_param("threshold", 10))
            .await
            .unwrap();
        let claim = registry.begin_cycle("Cam0", 3).await;

        let mut params = Mapping::new();
        params.insert("threshold".into(), 50.into());
        registry.update_params(id, params).await.unwrap();
        registry.rename(id, "renamed").await.unwrap();
        registry.set_enabled(id, false).await.unwrap();

        let mut hardware = Mapping::new();
        hardware.insert("exposure".into(), 10.into());
        assert!(matches!(
            registry.update_params(id, hardware).await,
            Err(VisionError::HardwareFieldInPipeline(_))
        ));

        // The cycle runs with what it claimed
        assert_eq!(claim.bindings[0].1.nickname, "p");
        assert_eq!(claim.bindings[0].1.param("threshold"), Some(&10.into()));

        registry.end_cycle(claim, &[id], &[]).await;
        let view = registry.get(id, &cameras(&["Cam0"])).await.unwrap();
        assert_eq!(view.settings.nickname, "renamed");
        assert_eq!(view.settings.param("threshold"), Some(&50.into()));
        assert_eq!(view.state, RunState::Disabled);
        assert!(registry.begin_cycle("Cam0", 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_missed_deadlines_counted() {
        let registry = PipelineRegistry::new();
        let id = registry.create("Cam0", PipelineSettings::new("p", "")).await.unwrap();
        for seq in 1..=2 {
            let claim = registry.begin_cycle("Cam0", seq).await;
            registry.end_cycle(claim, &[], &[]).await;
        }
        let view = registry.get(id, &cameras(&["Cam0"])).await.unwrap();
        assert_eq!(view.missed_deadlines, 2);
        assert_eq!(view.last_sequence, None);
        assert!(view.settings.enabled);
    }

    #[tokio::test]
    async fn test_failure_is_neither_result_nor_miss() {
        let registry = PipelineRegistry::new();
        let id = registry.create("Cam0", PipelineSettings::new("p", "")).await.unwrap();
        let claim = registry.begin_cycle("Cam0", 1).await;
        registry.end_cycle(claim, &[], &[]).await;
        let claim = registry.begin_cycle("Cam0", 2).await;
        registry.end_cycle(claim, &[], &[id]).await;

        let view = registry.get(id, &cameras(&["Cam0"])).await.unwrap();
        assert_eq!(view.last_sequence, None);
        assert_eq!(view.missed_deadlines, 0);
    }

    #[tokio::test]
    async fn test_from_records_keeps_ids() {
        let records = vec![
            PipelineRecord {
                id: PipelineId(4),
                settings: PipelineSettings::new("a", "Cam0"),
            },
            PipelineRecord {
                id: PipelineId(2),
                settings: PipelineSettings::new("b", "Cam0"),
            },
        ];
        let registry = PipelineRegistry::from_records(records, 1);
        let (records, next_id) = registry.records().await;
        assert_eq!(records[0].id, PipelineId(2));
        assert_eq!(records[1].id, PipelineId(4));
        assert_eq!(next_id, 5);
    }

    #[tokio::test]
    async fn test_unloadable_records_skipped() {
        let mut tainted = PipelineSettings::new("tainted", "Cam0");
        tainted.params.insert("gain".into(), 30.into());
        let records = vec![
            PipelineRecord {
                id: PipelineId(1),
                settings: PipelineSettings::new("a", "Cam0"),
            },
            PipelineRecord {
                id: PipelineId(1),
                settings: PipelineSettings::new("twin", "Cam0"),
            },
            PipelineRecord {
                id: PipelineId(7),
                settings: tainted,
            },
        ];
        let registry = PipelineRegistry::new();
        registry.load(records, 1).await;

        let (records, next_id) = registry.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].settings.nickname, "a");
        assert_eq!(next_id, 8);
    }
}
