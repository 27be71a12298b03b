//! Runtime facade
//!
//! [`VisionCore`] wires the registries, the router and the aggregator
//! together, runs migration before anything is loaded and exposes the
//! operations a control surface needs. Every successful mutation is saved.

use serde::Serialize;
use serde_yaml::Mapping;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

use crate::aggregator::{OutputAggregator, OutputBundle};
use crate::camera::{
    BackoffPolicy, CameraRegistry, CameraSettings, CameraView, HardwarePatch, HardwareSettings,
};
use crate::config::RuntimeConfig;
use crate::error::{Result, VisionError};
use crate::migration::{ConfigMigrator, MigrationOutcome, MigrationState};
use crate::pipeline::{PipelineId, PipelineRegistry, PipelineSettings, PipelineView};
use crate::ports::check_port_conflicts;
use crate::router::FrameRouter;
use crate::source::{OutputSink, PipelineProcessor, SourceProvider};
use crate::store::{detect_version, ConfigStore, PersistedDocument, CURRENT_VERSION};

/// Migration status as reported to the control surface
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub last_error: Option<String>,
    /// False while the persisted document is left untouched
    pub autosave: bool,
}

pub struct VisionCore {
    store: Arc<dyn ConfigStore>,
    migrator: ConfigMigrator,
    cameras: Arc<CameraRegistry>,
    pipelines: Arc<PipelineRegistry>,
    aggregator: Arc<OutputAggregator>,
    router: Arc<FrameRouter>,
    /// Registries hold the persisted document
    loaded: AtomicBool,
    save_lock: Mutex<()>,
}

impl VisionCore {
    /// Migrate the persisted document, then populate the registries from it.
    ///
    /// A failed migration leaves the legacy document in place and starts with
    /// empty registries; port conflicts and unreadable backups abort startup.
    pub async fn bootstrap(
        config: &RuntimeConfig,
        store: Arc<dyn ConfigStore>,
        provider: Arc<dyn SourceProvider>,
        processor: Arc<dyn PipelineProcessor>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        let migrator = ConfigMigrator::new(Arc::clone(&store));
        let migrated = match migrator.run() {
            Ok(outcome) => {
                log::info!("Configuration ready ({:?})", outcome);
                true
            }
            Err(VisionError::Migration(e)) => {
                log::error!(
                    "Migration rolled back ({}); starting without persisted cameras",
                    e
                );
                false
            }
            Err(e) => return Err(e),
        };

        let cameras = Arc::new(CameraRegistry::new(
            provider,
            BackoffPolicy::from_config(config),
            config.frame_pool_capacity,
        ));
        let pipelines = Arc::new(PipelineRegistry::new());
        let aggregator = Arc::new(OutputAggregator::new(sink, config.output_channel_capacity));
        let router = Arc::new(FrameRouter::new(
            Arc::clone(&cameras),
            Arc::clone(&pipelines),
            processor,
            Arc::clone(&aggregator),
            config,
        ));

        let core = Self {
            store,
            migrator,
            cameras,
            pipelines,
            aggregator,
            router,
            loaded: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        };
        if migrated {
            core.populate().await?;
        }
        Ok(core)
    }

    /// Load the current document into the empty registries.
    ///
    /// Every fatal check runs before the registries are touched. A camera or
    /// pipeline that cannot be loaded on its own is skipped with a warning;
    /// out-of-range hardware falls back to defaults.
    async fn populate(&self) -> Result<()> {
        let doc = match self.store.load()? {
            Some(blob) if detect_version(&blob)?.is_some() => PersistedDocument::parse(&blob)?,
            _ => PersistedDocument::default(),
        };
        check_port_conflicts(
            doc.cameras
                .iter()
                .filter_map(|c| c.stream_index.map(|i| (c.unique_name.as_str(), i))),
        )?;

        let mut camera_count = 0;
        for mut camera in doc.cameras {
            if let Err(e) = camera.hardware.validate(None) {
                log::warn!(
                    "[{}] Stored hardware settings rejected ({}); using defaults",
                    camera.unique_name,
                    e
                );
                camera.hardware = HardwareSettings::default();
            }
            let name = camera.unique_name.clone();
            match self.cameras.register(camera).await {
                Ok(_) => camera_count += 1,
                Err(e) => log::warn!("[{}] Skipping stored camera: {}", name, e),
            }
        }
        self.pipelines.load(doc.pipelines, doc.next_pipeline_id).await;
        self.loaded.store(true, Ordering::Release);
        log::info!("Loaded {} cameras", camera_count);
        Ok(())
    }

    fn autosave_enabled(&self) -> bool {
        self.loaded.load(Ordering::Acquire) && self.migrator.state() == MigrationState::Migrated
    }

    /// Persist the registries now.
    pub async fn save(&self) -> Result<()> {
        if !self.autosave_enabled() {
            return Err(VisionError::Persistence(format!(
                "document is {:?}; not overwriting it",
                self.migrator.state()
            )));
        }
        let _guard = self.save_lock.lock().await;
        let (pipelines, next_pipeline_id) = self.pipelines.records().await;
        let doc = PersistedDocument {
            version: CURRENT_VERSION,
            cameras: self.cameras.settings().await,
            pipelines,
            next_pipeline_id,
        };
        self.store.save(&doc.to_yaml()?)
    }

    async fn autosave(&self) {
        if !self.autosave_enabled() {
            log::debug!("Autosave suspended while migration is {:?}", self.migrator.state());
            return;
        }
        if let Err(e) = self.save().await {
            log::warn!("Failed to save configuration: {}", e);
        }
    }

    // Cameras

    pub async fn create_camera(&self, settings: CameraSettings) -> Result<CameraView> {
        let name = self.cameras.register(settings).await?;
        self.autosave().await;
        self.cameras.snapshot(&name).await
    }

    /// Delete a camera. With `force`, referencing pipelines are kept and
    /// report Paused; their ids are returned.
    pub async fn delete_camera(&self, name: &str, force: bool) -> Result<Vec<PipelineId>> {
        let paused = self
            .cameras
            .unregister(name, force, self.pipelines.as_ref())
            .await?;
        self.aggregator.forget(name).await;
        self.autosave().await;
        Ok(paused)
    }

    pub async fn apply_camera_settings(
        &self,
        name: &str,
        patch: &HardwarePatch,
    ) -> Result<CameraView> {
        let view = self.cameras.apply_settings(name, patch).await?;
        self.autosave().await;
        Ok(view)
    }

    pub async fn set_camera_nickname(&self, name: &str, nickname: &str) -> Result<()> {
        self.cameras.set_nickname(name, nickname).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn reconnect_camera(&self, name: &str) -> Result<()> {
        self.cameras.reconnect(name).await
    }

    pub async fn camera(&self, name: &str) -> Result<CameraView> {
        self.cameras.snapshot(name).await
    }

    pub async fn cameras(&self) -> Vec<CameraView> {
        self.cameras.list().await
    }

    // Pipelines

    pub async fn create_pipeline(
        &self,
        source_camera: &str,
        settings: PipelineSettings,
    ) -> Result<PipelineId> {
        let id = self.pipelines.create(source_camera, settings).await?;
        self.autosave().await;
        Ok(id)
    }

    pub async fn duplicate_pipeline(&self, id: PipelineId) -> Result<PipelineId> {
        let copy = self.pipelines.duplicate(id).await?;
        self.autosave().await;
        Ok(copy)
    }

    pub async fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        self.pipelines.delete(id).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn set_pipeline_source(&self, id: PipelineId, camera: &str) -> Result<()> {
        self.pipelines.set_source_camera(id, camera).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn set_pipeline_enabled(&self, id: PipelineId, enabled: bool) -> Result<()> {
        self.pipelines.set_enabled(id, enabled).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn update_pipeline_params(&self, id: PipelineId, params: Mapping) -> Result<()> {
        self.pipelines.update_params(id, params).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn rename_pipeline(&self, id: PipelineId, nickname: &str) -> Result<()> {
        self.pipelines.rename(id, nickname).await?;
        self.autosave().await;
        Ok(())
    }

    pub async fn pipeline(&self, id: PipelineId) -> Result<PipelineView> {
        let names = self.cameras.names().await;
        self.pipelines.get(id, &names).await
    }

    pub async fn pipelines(&self) -> Vec<PipelineView> {
        let names = self.cameras.names().await;
        self.pipelines.list(&names).await
    }

    pub async fn pipelines_for_camera(&self, name: &str) -> Vec<PipelineView> {
        self.pipelines.list_for_camera(name).await
    }

    // Output

    /// Aggregated output of one camera, one bundle per cycle.
    pub async fn subscribe_output(
        &self,
        camera: &str,
    ) -> Result<broadcast::Receiver<Arc<OutputBundle>>> {
        if !self.cameras.contains(camera).await {
            return Err(VisionError::CameraNotFound(camera.to_string()));
        }
        Ok(self.aggregator.subscribe(camera).await)
    }

    // Migration

    pub fn migration_status(&self) -> MigrationStatus {
        MigrationStatus {
            state: self.migrator.state(),
            last_error: self.migrator.last_error(),
            autosave: self.autosave_enabled(),
        }
    }

    /// Run migration again. Registries that started empty because of an
    /// earlier failure are replaced by the migrated document once it
    /// succeeds; anything created in memory meanwhile is dropped.
    pub async fn trigger_migration(&self) -> Result<MigrationOutcome> {
        let outcome = self.migrator.run()?;
        if self.loaded.load(Ordering::Acquire) {
            // The registries are newer than anything on disk
            self.autosave().await;
        } else {
            let cameras = self.cameras.names().await;
            let pipelines = self.pipelines.records().await.0.len();
            if !cameras.is_empty() || pipelines > 0 {
                log::warn!(
                    "Discarding {} unsaved cameras and {} unsaved pipelines",
                    cameras.len(),
                    pipelines
                );
            }
            self.cameras.clear().await;
            for name in &cameras {
                self.aggregator.forget(name).await;
            }
            self.pipelines.load(Vec::new(), 1).await;
            self.populate().await?;
        }
        Ok(outcome)
    }

    /// Put the pre-migration document back. Autosave stays off until the
    /// next successful migration.
    pub fn rollback_migration(&self) -> Result<()> {
        self.migrator.rollback()
    }

    // Lifecycle

    pub fn router(&self) -> Arc<FrameRouter> {
        Arc::clone(&self.router)
    }

    /// Route frames until `shutdown` fires, then close every camera.
    pub async fn run(&self, shutdown: watch::Receiver<()>) -> Result<()> {
        self.router().run(shutdown).await;
        self.shutdown().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down cameras...");
        self.cameras.shutdown().await;
        if self.autosave_enabled() {
            self.save().await?;
        }
        Ok(())
    }
}
