//! Test helpers for runtime scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use visionloop::pipeline::PipelineResult;
use visionloop::sim::TestPatternProvider;
use visionloop::source::NullSink;
use visionloop::{
    ConfigStore, FrameHandle, FrameInfo, OutputBundle, OutputSink, PipelineProcessor,
    PixelFormat, ProcessingError, RuntimeConfig, VisionCore,
};

/// One `process` call as seen by a pipeline
#[derive(Debug, Clone)]
pub struct Call {
    pub nickname: String,
    pub sequence: u64,
    pub pixels: Vec<u8>,
}

/// Processor that records every frame it sees.
///
/// A `delay_ms` parameter makes it sleep before answering. The result's
/// `extra` carries the sequence number it processed.
#[derive(Default)]
pub struct RecordingProcessor {
    calls: Mutex<Vec<Call>>,
}

impl RecordingProcessor {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineProcessor for RecordingProcessor {
    async fn process(
        &self,
        frame: &FrameHandle,
        settings: &visionloop::PipelineSettings,
    ) -> Result<PipelineResult, ProcessingError> {
        if let Some(ms) = settings.param("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.calls.lock().unwrap().push(Call {
            nickname: settings.nickname.clone(),
            sequence: frame.sequence(),
            pixels: frame.pixels().to_vec(),
        });
        Ok(PipelineResult {
            extra: serde_json::json!({ "sequence": frame.sequence() }),
            ..Default::default()
        })
    }
}

/// Sink that keeps every bundle with the port it was published on
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(u16, Arc<OutputBundle>)>>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<(u16, Arc<OutputBundle>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn publish(&self, output_port: u16, bundle: Arc<OutputBundle>) -> anyhow::Result<()> {
        self.published.lock().unwrap().push((output_port, bundle));
        Ok(())
    }
}

/// Short deadlines and backoff so scenarios finish quickly
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        capture_timeout_ms: 200,
        pipeline_deadline_ms: 100,
        idle_poll_ms: 5,
        backoff_initial_ms: 5,
        backoff_max_ms: 20,
        max_consecutive_failures: 50,
        output_channel_capacity: 256,
        ..Default::default()
    }
}

pub fn test_pattern() -> TestPatternProvider {
    TestPatternProvider::new(FrameInfo::new(16, 12, PixelFormat::Gray8))
        .with_frame_interval(Duration::from_millis(2))
}

/// Runtime over `store` with recording collaborators
pub async fn build_core(
    store: Arc<dyn ConfigStore>,
    provider: TestPatternProvider,
    processor: Arc<RecordingProcessor>,
    sink: Arc<dyn OutputSink>,
) -> Arc<VisionCore> {
    let core = VisionCore::bootstrap(&test_config(), store, Arc::new(provider), processor, sink)
        .await
        .expect("bootstrap");
    Arc::new(core)
}

pub fn null_sink() -> Arc<dyn OutputSink> {
    Arc::new(NullSink)
}

/// Next bundle, skipping over lag
pub async fn next_bundle(rx: &mut broadcast::Receiver<Arc<OutputBundle>>) -> Arc<OutputBundle> {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(bundle)) => return bundle,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("output channel closed: {e}"),
            Err(_) => panic!("no bundle within 5s"),
        }
    }
}
