//! Camera registry
//!
//! Owns every camera, its hardware settings and its capture device. The
//! capture device sits behind a per-camera mutex: a capture in flight and a
//! settings change never overlap.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use super::liveness::{BackoffPolicy, Liveness, LivenessState, ProbeDecision};
use super::settings::{validate_unique_name, CameraSettings, HardwarePatch, HardwareSettings};
use crate::error::{CaptureError, Result, VisionError};
use crate::frame::{FrameHandle, FramePool};
use crate::pipeline::PipelineId;
use crate::ports::{next_free_stream_index, StreamPorts};
use crate::source::{FrameSource, SourceProvider};

/// Lookup of pipelines that reference a camera by name.
#[async_trait]
pub trait CameraReferences: Send + Sync {
    /// Enabled pipelines whose source is `camera`
    async fn referencing(&self, camera: &str) -> Vec<PipelineId>;
}

/// Registry membership changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    Registered(String),
    Unregistered(String),
}

/// Read-only snapshot of a camera
#[derive(Debug, Clone, Serialize)]
pub struct CameraView {
    pub unique_name: String,
    pub nickname: String,
    pub stream_index: u32,
    pub ports: StreamPorts,
    pub hardware: HardwareSettings,
    pub liveness: LivenessState,
    pub consecutive_failures: u32,
    /// Retry budget spent; the camera waits for an explicit reconnect
    pub reconnect_exhausted: bool,
    pub last_error: Option<String>,
}

struct SettingsState {
    settings: CameraSettings,
    revision: u64,
}

struct CaptureSlot {
    source: Option<Box<dyn FrameSource>>,
    /// Settings revision last pushed to the device
    applied_revision: Option<u64>,
    video_modes: Option<usize>,
}

/// One registered camera
pub struct CameraEntry {
    name: String,
    stream_index: u32,
    ports: StreamPorts,
    settings: RwLock<SettingsState>,
    capture: Mutex<CaptureSlot>,
    liveness: Mutex<Liveness>,
    pool: Arc<FramePool>,
    provider: Arc<dyn SourceProvider>,
    next_sequence: AtomicU64,
    retired: AtomicBool,
}

impl CameraEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> StreamPorts {
        self.ports
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub async fn view(&self) -> CameraView {
        let settings = self.settings.read().await.settings.clone();
        let liveness = self.liveness.lock().await;
        CameraView {
            unique_name: settings.unique_name,
            nickname: settings.nickname,
            stream_index: self.stream_index,
            ports: self.ports,
            hardware: settings.hardware,
            liveness: liveness.state(),
            consecutive_failures: liveness.consecutive_failures(),
            reconnect_exhausted: liveness.is_exhausted(),
            last_error: liveness.last_error().map(str::to_string),
        }
    }

    /// How long the capture loop should wait before trying again, if at all.
    pub async fn retry_delay(&self) -> Option<Duration> {
        match self.liveness.lock().await.decide(Instant::now()) {
            ProbeDecision::Wait(delay) => Some(delay),
            ProbeDecision::Exhausted => None,
            ProbeDecision::Capture | ProbeDecision::Probe => Some(Duration::ZERO),
        }
    }

    /// Capture the next frame, bounded by `timeout`.
    ///
    /// Probes the device when its backoff elapsed and pushes pending settings
    /// before capturing. Failures update liveness and are returned to the
    /// caller, which skips the cycle.
    pub async fn capture(&self, timeout: Duration) -> std::result::Result<FrameHandle, CaptureError> {
        let mut guard = self.capture.lock().await;
        let slot = &mut *guard;
        if self.is_retired() {
            return Err(CaptureError::Unavailable("camera removed".to_string()));
        }

        let decision = self.liveness.lock().await.decide(Instant::now());
        match decision {
            ProbeDecision::Capture => {}
            ProbeDecision::Wait(_) | ProbeDecision::Exhausted => return Err(CaptureError::Backoff),
            ProbeDecision::Probe => {
                if let Err(e) = self.probe(slot).await {
                    return Err(self.fail(e).await);
                }
            }
        }

        let (hardware, revision) = {
            let state = self.settings.read().await;
            (state.settings.hardware.clone(), state.revision)
        };
        let Some(source) = slot.source.as_mut() else {
            return Err(self.fail(CaptureError::Unavailable("device not open".into())).await);
        };
        if slot.applied_revision != Some(revision) {
            if let Err(e) = source.apply_settings(&hardware).await {
                return Err(self.fail(e).await);
            }
            log::debug!("[{}] Applied settings revision {}", self.name, revision);
            slot.applied_revision = Some(revision);
        }

        let mut buffer = self.pool.acquire();
        let outcome = tokio::time::timeout(timeout, source.capture_next(&mut buffer)).await;
        let result = match outcome {
            Ok(Ok(info)) => {
                let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1;
                FrameHandle::pooled(sequence, info, buffer, Arc::clone(&self.pool))
            }
            Ok(Err(e)) => {
                self.pool.recycle(buffer);
                Err(e)
            }
            Err(_) => {
                self.pool.recycle(buffer);
                Err(CaptureError::Timeout(timeout.as_millis() as u64))
            }
        };
        drop(guard);

        match result {
            Ok(frame) => {
                if self.liveness.lock().await.record_success() {
                    log::info!("[{}] Camera connected", self.name);
                }
                Ok(frame)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn probe(&self, slot: &mut CaptureSlot) -> std::result::Result<(), CaptureError> {
        log::info!("[{}] Probing camera", self.name);
        match slot.source.as_mut() {
            Some(source) => source.reconnect().await?,
            None => {
                let settings = self.settings.read().await.settings.clone();
                let source = self.provider.open(&settings)?;
                slot.video_modes = source.video_modes();
                slot.source = Some(source);
            }
        }
        // The device may have lost its configuration
        slot.applied_revision = None;
        // Liveness only recovers once a frame arrives
        log::info!("[{}] Device reopened", self.name);
        Ok(())
    }

    async fn fail(&self, err: CaptureError) -> CaptureError {
        let mut liveness = self.liveness.lock().await;
        if liveness.record_failure(&err, Instant::now()) {
            log::warn!("[{}] Camera {:?}: {}", self.name, liveness.state(), err);
        } else {
            log::debug!(
                "[{}] Capture failed ({} in a row): {}",
                self.name,
                liveness.consecutive_failures(),
                err
            );
        }
        if liveness.is_exhausted() {
            log::warn!(
                "[{}] Giving up after {} consecutive failures; waiting for reconnect",
                self.name,
                liveness.consecutive_failures()
            );
        }
        err
    }

    async fn close(&self) {
        self.retired.store(true, Ordering::Release);
        let mut slot = self.capture.lock().await;
        if let Some(mut source) = slot.source.take() {
            source.close().await;
        }
    }
}

#[derive(Default)]
struct RegistryState {
    cameras: IndexMap<String, Arc<CameraEntry>>,
    /// Names of deleted cameras
    retired: HashSet<String>,
}

/// Registry of every known camera, in registration order
pub struct CameraRegistry {
    state: RwLock<RegistryState>,
    provider: Arc<dyn SourceProvider>,
    policy: BackoffPolicy,
    pool_capacity: usize,
    events: broadcast::Sender<CameraEvent>,
}

impl CameraRegistry {
    pub fn new(provider: Arc<dyn SourceProvider>, policy: BackoffPolicy, pool_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(RegistryState::default()),
            provider,
            policy,
            pool_capacity,
            events,
        }
    }

    /// Subscribe to registrations and removals
    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    /// Register a camera and open its device.
    ///
    /// A device that fails to open leaves the camera registered in the
    /// `Error` state; it is probed again with backoff.
    pub async fn register(&self, mut settings: CameraSettings) -> Result<String> {
        validate_unique_name(&settings.unique_name)?;
        settings.hardware.validate(None)?;

        let mut state = self.state.write().await;
        let name = settings.unique_name.clone();
        if state.cameras.contains_key(&name) {
            return Err(VisionError::DuplicateCamera(name));
        }
        if state.retired.contains(&name) {
            return Err(VisionError::CameraNameRetired(name));
        }

        let used = state
            .cameras
            .values()
            .map(|c| (c.name.as_str(), c.stream_index));
        let stream_index = match settings.stream_index {
            Some(index) => {
                if let Some((other, _)) = used.clone().find(|(_, i)| *i == index) {
                    return Err(VisionError::PortConflict {
                        first: other.to_string(),
                        second: name,
                        stream_index: index,
                    });
                }
                index
            }
            None => next_free_stream_index(used.map(|(_, i)| i)),
        };
        let ports = StreamPorts::for_stream_index(stream_index)?;
        settings.stream_index = Some(stream_index);
        if settings.nickname.is_empty() {
            settings.nickname = name.clone();
        }

        let (slot, liveness) = match self.provider.open(&settings) {
            Ok(source) => {
                let video_modes = source.video_modes();
                if let Err(e) = settings.hardware.validate(video_modes) {
                    log::warn!("[{}] Stored settings do not fit the device: {}", name, e);
                    settings.hardware.video_mode_index = 0;
                }
                (
                    CaptureSlot {
                        source: Some(source),
                        applied_revision: None,
                        video_modes,
                    },
                    Liveness::new(self.policy),
                )
            }
            Err(e) => {
                log::warn!("[{}] Failed to open camera: {}", name, e);
                (
                    CaptureSlot {
                        source: None,
                        applied_revision: None,
                        video_modes: None,
                    },
                    Liveness::failed(self.policy, e.to_string()),
                )
            }
        };

        let entry = Arc::new(CameraEntry {
            name: name.clone(),
            stream_index,
            ports,
            settings: RwLock::new(SettingsState {
                settings,
                revision: 0,
            }),
            capture: Mutex::new(slot),
            liveness: Mutex::new(liveness),
            pool: FramePool::new(self.pool_capacity),
            provider: Arc::clone(&self.provider),
            next_sequence: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        });
        state.cameras.insert(name.clone(), entry);
        drop(state);

        log::info!(
            "[{}] Camera registered on stream {} (ports {}/{})",
            name,
            stream_index,
            ports.input,
            ports.output
        );
        let _ = self.events.send(CameraEvent::Registered(name.clone()));
        Ok(name)
    }

    /// Remove a camera.
    ///
    /// Fails with `CameraInUse` while enabled pipelines reference it, unless
    /// `force` is set; those pipelines are then left paused. Returns the
    /// pipelines that referenced the camera.
    pub async fn unregister(
        &self,
        name: &str,
        force: bool,
        references: &dyn CameraReferences,
    ) -> Result<Vec<PipelineId>> {
        if !self.state.read().await.cameras.contains_key(name) {
            return Err(VisionError::CameraNotFound(name.to_string()));
        }
        let users = references.referencing(name).await;
        if !users.is_empty() && !force {
            return Err(VisionError::CameraInUse {
                camera: name.to_string(),
                pipelines: users,
            });
        }

        let entry = {
            let mut state = self.state.write().await;
            let entry = state
                .cameras
                .shift_remove(name)
                .ok_or_else(|| VisionError::CameraNotFound(name.to_string()))?;
            state.retired.insert(name.to_string());
            entry
        };
        entry.close().await;

        if users.is_empty() {
            log::info!("[{}] Camera removed", name);
        } else {
            log::warn!("[{}] Camera removed, pausing pipelines {:?}", name, users);
        }
        let _ = self.events.send(CameraEvent::Unregistered(name.to_string()));
        Ok(users)
    }

    /// Validate and apply a hardware patch atomically.
    ///
    /// Waits for any capture in flight; the device sees the new settings on
    /// the next capture.
    pub async fn apply_settings(&self, name: &str, patch: &HardwarePatch) -> Result<CameraView> {
        let entry = self.entry(name).await?;
        {
            let slot = entry.capture.lock().await;
            let mut state = entry.settings.write().await;
            let next = state.settings.hardware.patched(patch, slot.video_modes)?;
            state.settings.hardware = next;
            state.revision += 1;
        }
        // A settings change is the operator's cue to try the device again
        entry.liveness.lock().await.rearm();
        log::info!("[{}] Settings updated", name);
        Ok(entry.view().await)
    }

    pub async fn set_nickname(&self, name: &str, nickname: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        entry.settings.write().await.settings.nickname = nickname.to_string();
        Ok(())
    }

    /// Reset the retry budget of a disconnected camera.
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        entry.liveness.lock().await.rearm();
        log::info!("[{}] Reconnect requested", name);
        Ok(())
    }

    pub async fn snapshot(&self, name: &str) -> Result<CameraView> {
        Ok(self.entry(name).await?.view().await)
    }

    /// Every camera, in registration order
    pub async fn list(&self) -> Vec<CameraView> {
        let mut views = Vec::new();
        for entry in self.entries().await {
            views.push(entry.view().await);
        }
        views
    }

    pub async fn names(&self) -> HashSet<String> {
        self.state.read().await.cameras.keys().cloned().collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.cameras.contains_key(name)
    }

    /// Fresh name lookup; pipelines never keep the result across cycles.
    pub async fn entry(&self, name: &str) -> Result<Arc<CameraEntry>> {
        self.state
            .read()
            .await
            .cameras
            .get(name)
            .cloned()
            .ok_or_else(|| VisionError::CameraNotFound(name.to_string()))
    }

    pub async fn entries(&self) -> Vec<Arc<CameraEntry>> {
        self.state.read().await.cameras.values().cloned().collect()
    }

    /// Persistable settings of every camera, in registration order
    pub async fn settings(&self) -> Vec<CameraSettings> {
        let mut out = Vec::new();
        for entry in self.entries().await {
            out.push(entry.settings.read().await.settings.clone());
        }
        out
    }

    /// Close and forget every camera, retired names included.
    pub async fn clear(&self) {
        let removed = std::mem::take(&mut *self.state.write().await);
        for (name, entry) in removed.cameras {
            entry.close().await;
            let _ = self.events.send(CameraEvent::Unregistered(name));
        }
    }

    /// Close every device.
    pub async fn shutdown(&self) {
        for entry in self.entries().await {
            entry.close().await;
        }
    }
}
