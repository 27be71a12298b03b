//! Collaborator contracts consumed by the runtime.
//!
//! Capture drivers, image-processing algorithms and streaming transports live
//! outside this crate; they plug in through these traits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::aggregator::OutputBundle;
use crate::camera::{CameraSettings, HardwareSettings};
use crate::error::{CaptureError, ProcessingError};
use crate::frame::{FrameHandle, FrameInfo};
use crate::pipeline::{PipelineResult, PipelineSettings};

/// Frame-capture device owned exclusively by one camera.
#[async_trait]
pub trait FrameSource: Send {
    /// Capture the next frame into `buffer`, which arrives empty.
    ///
    /// The runtime bounds this call with the capture timeout; on timeout the
    /// future is dropped.
    async fn capture_next(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, CaptureError>;

    /// Push hardware settings to the device. Called before the first capture
    /// and before the first capture following every settings change.
    async fn apply_settings(&mut self, _hardware: &HardwareSettings) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Try to re-establish the device after failures.
    async fn reconnect(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Number of video modes the device supports, if known
    fn video_modes(&self) -> Option<usize> {
        None
    }

    /// Release the device.
    async fn close(&mut self) {}
}

/// Opens the capture device for a camera.
pub trait SourceProvider: Send + Sync {
    fn open(&self, camera: &CameraSettings) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Opaque per-pipeline image processing.
///
/// The frame is borrowed for the duration of the call only; a call that
/// overruns the cycle deadline is cancelled.
#[async_trait]
pub trait PipelineProcessor: Send + Sync {
    async fn process(
        &self,
        frame: &FrameHandle,
        settings: &PipelineSettings,
    ) -> Result<PipelineResult, ProcessingError>;
}

/// Streaming/telemetry consumer of aggregated camera output.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one camera's bundle on its output port.
    async fn publish(&self, output_port: u16, bundle: Arc<OutputBundle>) -> anyhow::Result<()>;
}

/// Sink that discards everything; subscribers still receive bundles.
pub struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn publish(&self, _output_port: u16, _bundle: Arc<OutputBundle>) -> anyhow::Result<()> {
        Ok(())
    }
}
