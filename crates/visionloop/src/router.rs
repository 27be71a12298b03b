//! Frame routing
//!
//! Each camera runs its own capture loop. One cycle captures a single frame,
//! hands a shared reference to every enabled pipeline bound to the camera,
//! waits for all of them up to the cycle deadline and passes the completed
//! cycle to the aggregator. Cameras never wait on each other.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregator::{CycleBarrier, OutputAggregator, PipelineOutcome};
use crate::camera::{CameraEntry, CameraEvent, CameraRegistry};
use crate::config::RuntimeConfig;
use crate::error::{CaptureError, VisionError};
use crate::pipeline::{PipelineId, PipelineRegistry};
use crate::source::PipelineProcessor;

/// What one camera cycle did
#[derive(Debug)]
pub enum CycleOutcome {
    /// No enabled pipeline is bound to the camera; nothing was captured
    Idle,
    /// Capture failed; the cycle produced no output
    Skipped(CaptureError),
    /// Frame captured and processed, but no bundle could be built from it
    Dropped(VisionError),
    Published {
        sequence: u64,
        /// Pipelines that produced a result
        contributors: usize,
        /// Pipelines that failed or overran the deadline
        missed: Vec<PipelineId>,
    },
}

/// Drives the capture/process/aggregate cycle of every camera
pub struct FrameRouter {
    cameras: Arc<CameraRegistry>,
    pipelines: Arc<PipelineRegistry>,
    processor: Arc<dyn PipelineProcessor>,
    aggregator: Arc<OutputAggregator>,
    capture_timeout: Duration,
    deadline: Duration,
    idle_poll: Duration,
}

impl FrameRouter {
    pub fn new(
        cameras: Arc<CameraRegistry>,
        pipelines: Arc<PipelineRegistry>,
        processor: Arc<dyn PipelineProcessor>,
        aggregator: Arc<OutputAggregator>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            cameras,
            pipelines,
            processor,
            aggregator,
            capture_timeout: config.capture_timeout(),
            deadline: config.pipeline_deadline(),
            idle_poll: config.idle_poll(),
        }
    }

    /// Run a single cycle of `camera`.
    pub async fn run_cycle(&self, camera: &CameraEntry) -> CycleOutcome {
        let name = camera.name();
        if self.pipelines.list_for_camera(name).await.is_empty() {
            return CycleOutcome::Idle;
        }

        let frame = match camera.capture(self.capture_timeout).await {
            Ok(frame) => frame,
            Err(e) => return CycleOutcome::Skipped(e),
        };
        let sequence = frame.sequence();

        // Bindings are fixed for the rest of the cycle
        let claim = self.pipelines.begin_cycle(name, sequence).await;
        if claim.is_empty() {
            self.pipelines.end_cycle(claim, &[], &[]).await;
            return CycleOutcome::Idle;
        }

        let (tx, mut rx) = mpsc::channel(claim.bindings.len());
        let mut barrier = CycleBarrier::new(name, sequence);
        let mut tasks = Vec::with_capacity(claim.bindings.len());
        for (id, settings) in &claim.bindings {
            barrier.expect(*id, &settings.nickname, settings.output.clone());

            let id = *id;
            let frame = frame.share();
            let settings = settings.clone();
            let processor = Arc::clone(&self.processor);
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = match processor.process(&frame, &settings).await {
                    Ok(result) => PipelineOutcome::Completed(result),
                    Err(e) => PipelineOutcome::Failed(e),
                };
                let sequence = frame.sequence();
                drop(frame);
                let _ = tx.send((sequence, id, outcome)).await;
            }));
        }
        drop(tx);

        let deadline = Instant::now() + self.deadline;
        while !barrier.is_complete() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((seq, id, outcome))) => {
                    if let PipelineOutcome::Failed(e) = &outcome {
                        log::warn!("[{}] Pipeline {} failed on frame {}: {}", name, id, seq, e);
                    }
                    barrier.accept(seq, id, outcome);
                }
                // Every task is gone, panicked ones included
                Ok(None) => break,
                Err(_) => break,
            }
        }
        // Overrunning pipelines lose their frame reference here
        for task in &tasks {
            task.abort();
        }

        let completed = barrier.completed();
        let (cycle, expired) = barrier.close();
        for id in &expired {
            log::warn!(
                "[{}] {}",
                name,
                VisionError::ProcessingTimeout {
                    pipeline: *id,
                    sequence
                }
            );
        }
        let failed: Vec<PipelineId> = claim
            .ids()
            .into_iter()
            .filter(|id| !expired.contains(id) && !completed.contains(id))
            .collect();
        self.pipelines.end_cycle(claim, &completed, &failed).await;

        let bundle = match self.aggregator.aggregate(&frame, camera.ports(), cycle) {
            Ok(bundle) => bundle,
            Err(e) => {
                log::error!("[{}] Dropping frame {}: {}", name, sequence, e);
                return CycleOutcome::Dropped(e);
            }
        };
        drop(frame);
        let missed = bundle.missing.iter().map(|m| m.pipeline).collect::<Vec<_>>();
        self.aggregator.publish(bundle).await;

        CycleOutcome::Published {
            sequence,
            contributors: completed.len(),
            missed,
        }
    }

    /// Capture loop of one camera; ends when the camera is removed or on shutdown.
    pub async fn camera_loop(self: Arc<Self>, camera: Arc<CameraEntry>, mut shutdown: watch::Receiver<()>) {
        log::info!("[{}] Capture loop started", camera.name());
        loop {
            if camera.is_retired() || shutdown.has_changed().unwrap_or(true) {
                break;
            }
            let pause = match self.run_cycle(&camera).await {
                CycleOutcome::Published { .. } | CycleOutcome::Dropped(_) => None,
                CycleOutcome::Idle => Some(self.idle_poll),
                CycleOutcome::Skipped(_) => Some(
                    camera
                        .retry_delay()
                        .await
                        .unwrap_or(self.idle_poll)
                        .max(Duration::from_millis(1)),
                ),
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        log::info!("[{}] Capture loop stopped", camera.name());
    }

    /// Supervise one capture loop per registered camera until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        let mut events = self.cameras.subscribe();
        let mut loops: HashMap<String, JoinHandle<()>> = HashMap::new();
        self.spawn_missing(&mut loops, &shutdown).await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(CameraEvent::Registered(_)) => self.spawn_missing(&mut loops, &shutdown).await,
                    Ok(CameraEvent::Unregistered(name)) => {
                        // The loop notices the removal on its own
                        loops.remove(&name);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} camera events, resynchronizing", skipped);
                        loops.retain(|_, handle| !handle.is_finished());
                        self.spawn_missing(&mut loops, &shutdown).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        log::info!("Stopping {} capture loops...", loops.len());
        join_all(loops.into_values()).await;
    }

    async fn spawn_missing(
        self: &Arc<Self>,
        loops: &mut HashMap<String, JoinHandle<()>>,
        shutdown: &watch::Receiver<()>,
    ) {
        for entry in self.cameras.entries().await {
            if loops.contains_key(entry.name()) {
                continue;
            }
            let name = entry.name().to_string();
            let handle = tokio::spawn(Arc::clone(self).camera_loop(entry, shutdown.clone()));
            loops.insert(name, handle);
        }
    }
}
