//! Synthetic collaborators for demos and tests.
//!
//! [`TestPatternProvider`] opens sources that render a moving bright spot on
//! a gradient, [`BrightSpotProcessor`] finds it again and [`LogSink`] logs
//! what the runtime publishes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::OutputBundle;
use crate::camera::{CameraSettings, HardwareSettings};
use crate::error::{CaptureError, ProcessingError};
use crate::frame::{FrameHandle, FrameInfo, PixelFormat};
use crate::pipeline::{Color, Overlay, PipelineResult, PipelineSettings, Target};
use crate::source::{FrameSource, OutputSink, PipelineProcessor, SourceProvider};

/// Opens [`TestPatternSource`]s of a fixed geometry
pub struct TestPatternProvider {
    info: FrameInfo,
    frame_interval: Duration,
    /// Captures left to fail, shared by every source this provider opens
    failures: Arc<AtomicU32>,
    unavailable: bool,
}

impl TestPatternProvider {
    pub fn new(info: FrameInfo) -> Self {
        Self {
            info,
            frame_interval: Duration::ZERO,
            failures: Arc::new(AtomicU32::new(0)),
            unavailable: false,
        }
    }

    /// Pace captures like a real sensor
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Fail the next `count` captures with a device error
    pub fn failing_captures(self, count: u32) -> Self {
        self.failures.store(count, Ordering::Release);
        self
    }

    /// Refuse to open any device
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

impl SourceProvider for TestPatternProvider {
    fn open(&self, camera: &CameraSettings) -> Result<Box<dyn FrameSource>, CaptureError> {
        if self.unavailable {
            return Err(CaptureError::Unavailable(format!(
                "no device for '{}'",
                camera.unique_name
            )));
        }
        Ok(Box::new(TestPatternSource {
            info: self.info,
            frame_interval: self.frame_interval,
            failures: Arc::clone(&self.failures),
            hardware: camera.hardware.clone(),
            tick: 0,
        }))
    }
}

/// Renders a gradient whose level follows the brightness setting, with a
/// saturated spot moving left to right
pub struct TestPatternSource {
    info: FrameInfo,
    frame_interval: Duration,
    failures: Arc<AtomicU32>,
    hardware: HardwareSettings,
    tick: u64,
}

impl TestPatternSource {
    fn spot(&self) -> (u32, u32) {
        let x = (self.tick % u64::from(self.info.width.max(1))) as u32;
        (x, self.info.height / 2)
    }
}

#[async_trait]
impl FrameSource for TestPatternSource {
    async fn capture_next(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, CaptureError> {
        if !self.frame_interval.is_zero() {
            tokio::time::sleep(self.frame_interval).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CaptureError::Device("injected capture failure".into()));
        }

        let FrameInfo { width, height, format } = self.info;
        let level = (self.hardware.brightness.clamp(0, 100) as u32 * 127 / 100) as u8;
        let (spot_x, spot_y) = self.spot();
        buffer.reserve(self.info.byte_len());
        for y in 0..height {
            for x in 0..width {
                let value = if (x, y) == (spot_x, spot_y) {
                    255
                } else {
                    level.saturating_add(((x + y) % 64) as u8)
                };
                match format {
                    PixelFormat::Gray8 => buffer.push(value),
                    PixelFormat::Rgb8 => buffer.extend_from_slice(&[value, value, value]),
                }
            }
        }
        self.tick += 1;
        Ok(self.info)
    }

    async fn apply_settings(&mut self, hardware: &HardwareSettings) -> Result<(), CaptureError> {
        self.hardware = hardware.clone();
        Ok(())
    }

    fn video_modes(&self) -> Option<usize> {
        Some(1)
    }
}

/// Locates the brightest pixel at or above the `threshold` parameter
/// (default 200) and marks it
pub struct BrightSpotProcessor;

impl BrightSpotProcessor {
    const DEFAULT_THRESHOLD: u64 = 200;
}

#[async_trait]
impl PipelineProcessor for BrightSpotProcessor {
    async fn process(
        &self,
        frame: &FrameHandle,
        settings: &PipelineSettings,
    ) -> Result<PipelineResult, ProcessingError> {
        let threshold = match settings.param("threshold") {
            None => Self::DEFAULT_THRESHOLD,
            Some(value) => value.as_u64().filter(|t| *t <= 255).ok_or_else(|| {
                ProcessingError::InvalidParams(format!("threshold: {:?}", value))
            })?,
        } as u8;

        let info = frame.info();
        let bpp = info.format.bytes_per_pixel();
        let mut best: Option<(usize, u8)> = None;
        for (index, pixel) in frame.pixels().chunks_exact(bpp).enumerate() {
            let value = *pixel.iter().max().unwrap_or(&0);
            if value >= threshold && best.map_or(true, |(_, b)| value > b) {
                best = Some((index, value));
            }
        }

        let Some((index, value)) = best else {
            return Ok(PipelineResult::default());
        };
        let x = (index % info.width as usize) as i32;
        let y = (index / info.width as usize) as i32;
        let pixels = f64::from(info.width) * f64::from(info.height);
        Ok(PipelineResult::default()
            .with_target(Target {
                center_x: f64::from(x),
                center_y: f64::from(y),
                area: 1.0 / pixels,
                confidence: f64::from(value) / 255.0,
            })
            .with_overlay(Overlay::Rect {
                x: x - 2,
                y: y - 2,
                width: 5,
                height: 5,
                color: Color::GREEN,
            }))
    }
}

/// Sink that logs every bundle
pub struct LogSink;

#[async_trait]
impl OutputSink for LogSink {
    async fn publish(&self, output_port: u16, bundle: Arc<OutputBundle>) -> anyhow::Result<()> {
        log::debug!(
            "[{}] frame {} on :{} ({} results, {} missing)",
            bundle.camera,
            bundle.sequence,
            output_port,
            bundle.results.len(),
            bundle.missing.len()
        );
        Ok(())
    }
}
