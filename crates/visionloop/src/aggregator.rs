//! Per-camera output aggregation
//!
//! Results for one camera cycle are gathered in a [`CycleBarrier`]. Only a
//! barrier in which every bound pipeline has either reported for the cycle's
//! sequence number or been marked missed can become a [`CompletedCycle`], and
//! only a completed cycle can be aggregated into an [`OutputBundle`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{ProcessingError, Result, VisionError};
use crate::frame::{FrameHandle, FrameInfo, PixelFormat};
use crate::pipeline::{Color, OutputFlags, Overlay, PipelineId, PipelineResult};
use crate::ports::StreamPorts;
use crate::source::OutputSink;

/// Outcome of one pipeline for one cycle
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed(PipelineResult),
    Failed(ProcessingError),
    TimedOut,
}

/// Why a bound pipeline did not contribute to a bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum MissReason {
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
struct Member {
    nickname: String,
    output: OutputFlags,
    outcome: Option<PipelineOutcome>,
}

/// Join point for the pipelines of one camera cycle
#[derive(Debug)]
pub struct CycleBarrier {
    camera: String,
    sequence: u64,
    members: BTreeMap<PipelineId, Member>,
}

impl CycleBarrier {
    pub fn new(camera: &str, sequence: u64) -> Self {
        Self {
            camera: camera.to_string(),
            sequence,
            members: BTreeMap::new(),
        }
    }

    /// Expect a result from `id` this cycle.
    pub fn expect(&mut self, id: PipelineId, nickname: &str, output: OutputFlags) {
        self.members.insert(
            id,
            Member {
                nickname: nickname.to_string(),
                output,
                outcome: None,
            },
        );
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Record an outcome. Outcomes tagged with another sequence number, from
    /// pipelines not bound to this cycle, or repeated, are discarded.
    pub fn accept(&mut self, sequence: u64, id: PipelineId, outcome: PipelineOutcome) -> bool {
        if sequence != self.sequence {
            log::debug!(
                "[{}] Dropping stale result of pipeline {} for frame {} (cycle {})",
                self.camera,
                id,
                sequence,
                self.sequence
            );
            return false;
        }
        match self.members.get_mut(&id) {
            Some(member) if member.outcome.is_none() => {
                member.outcome = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Pipelines that have not reported yet
    pub fn pending(&self) -> Vec<PipelineId> {
        self.members
            .iter()
            .filter(|(_, m)| m.outcome.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.members.values().all(|m| m.outcome.is_some())
    }

    /// Mark every pipeline that has not reported as timed out.
    pub fn expire(&mut self) -> Vec<PipelineId> {
        let mut expired = Vec::new();
        for (id, member) in self.members.iter_mut() {
            if member.outcome.is_none() {
                member.outcome = Some(PipelineOutcome::TimedOut);
                expired.push(*id);
            }
        }
        expired
    }

    /// Pipelines that produced a result
    pub fn completed(&self) -> Vec<PipelineId> {
        self.members
            .iter()
            .filter(|(_, m)| matches!(m.outcome, Some(PipelineOutcome::Completed(_))))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Close the barrier at the deadline. Pipelines that have not reported
    /// count as timed out and are returned alongside the cycle.
    pub fn close(mut self) -> (CompletedCycle, Vec<PipelineId>) {
        let expired = self.expire();
        let cycle = CompletedCycle {
            camera: self.camera,
            sequence: self.sequence,
            members: self.members,
        };
        (cycle, expired)
    }

    /// Close the barrier; hands the barrier back if pipelines are still pending.
    pub fn finish(self) -> std::result::Result<CompletedCycle, CycleBarrier> {
        if !self.is_complete() {
            return Err(self);
        }
        Ok(CompletedCycle {
            camera: self.camera,
            sequence: self.sequence,
            members: self.members,
        })
    }
}

/// A barrier in which every bound pipeline has a final outcome
#[derive(Debug)]
pub struct CompletedCycle {
    camera: String,
    sequence: u64,
    members: BTreeMap<PipelineId, Member>,
}

impl CompletedCycle {
    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Structured result of one contributing pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: PipelineId,
    pub nickname: String,
    pub result: PipelineResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissedPipeline {
    pub pipeline: PipelineId,
    pub reason: MissReason,
}

/// Base frame with every contributing overlay composited
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedFrame {
    pub info: FrameInfo,
    #[serde(skip)]
    pub pixels: Vec<u8>,
}

/// Merged output of one camera for one cycle
#[derive(Debug, Clone, Serialize)]
pub struct OutputBundle {
    pub camera: String,
    pub sequence: u64,
    pub captured_at_ns: u64,
    pub ports: StreamPorts,
    pub frame: AnnotatedFrame,
    /// Results of contributing pipelines, ascending by pipeline id
    pub results: Vec<PipelineReport>,
    /// Bound pipelines that did not contribute this cycle
    pub missing: Vec<MissedPipeline>,
}

/// Merges pipeline results per camera and hands bundles to the sink and
/// to subscribers
pub struct OutputAggregator {
    sink: Arc<dyn OutputSink>,
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<OutputBundle>>>>,
    capacity: usize,
}

impl OutputAggregator {
    pub fn new(sink: Arc<dyn OutputSink>, capacity: usize) -> Self {
        Self {
            sink,
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Build the bundle for a completed cycle of `frame`.
    ///
    /// Overlays are drawn on a single copy of the base frame in ascending
    /// pipeline id order.
    pub fn aggregate(
        &self,
        frame: &FrameHandle,
        ports: StreamPorts,
        cycle: CompletedCycle,
    ) -> Result<OutputBundle> {
        if frame.sequence() != cycle.sequence {
            return Err(VisionError::StaleCycle {
                frame: frame.sequence(),
                results: cycle.sequence,
            });
        }

        let info = frame.info();
        let mut canvas = Canvas {
            info,
            pixels: frame.pixels().to_vec(),
        };
        let mut results = Vec::new();
        let mut missing = Vec::new();

        for (id, member) in cycle.members {
            match member.outcome {
                Some(PipelineOutcome::Completed(result)) => {
                    if member.output.draw_overlays {
                        for overlay in &result.overlays {
                            canvas.draw(overlay);
                        }
                    }
                    if member.output.publish_results {
                        results.push(PipelineReport {
                            pipeline: id,
                            nickname: member.nickname,
                            result,
                        });
                    }
                }
                Some(PipelineOutcome::Failed(e)) => missing.push(MissedPipeline {
                    pipeline: id,
                    reason: MissReason::Failed(e.to_string()),
                }),
                Some(PipelineOutcome::TimedOut) | None => missing.push(MissedPipeline {
                    pipeline: id,
                    reason: MissReason::TimedOut,
                }),
            }
        }

        Ok(OutputBundle {
            camera: cycle.camera,
            sequence: cycle.sequence,
            captured_at_ns: frame.captured_at_ns(),
            ports,
            frame: AnnotatedFrame {
                info,
                pixels: canvas.pixels,
            },
            results,
            missing,
        })
    }

    /// Deliver a bundle to subscribers and to the sink on the output port.
    pub async fn publish(&self, bundle: OutputBundle) {
        let bundle = Arc::new(bundle);
        if let Some(tx) = self.channels.read().await.get(&bundle.camera) {
            // No receivers is fine
            let _ = tx.send(Arc::clone(&bundle));
        }
        let port = bundle.ports.output;
        if let Err(e) = self.sink.publish(port, Arc::clone(&bundle)).await {
            log::warn!(
                "[{}] Failed to publish frame {} on port {}: {}",
                bundle.camera,
                bundle.sequence,
                port,
                e
            );
        }
    }

    /// Receive every bundle published for `camera` from now on.
    pub async fn subscribe(&self, camera: &str) -> broadcast::Receiver<Arc<OutputBundle>> {
        let mut channels = self.channels.write().await;
        channels
            .entry(camera.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Close the output channel of a removed camera.
    pub async fn forget(&self, camera: &str) {
        self.channels.write().await.remove(camera);
    }
}

struct Canvas {
    info: FrameInfo,
    pixels: Vec<u8>,
}

impl Canvas {
    fn put(&mut self, x: i64, y: i64, color: Color) {
        if x < 0 || y < 0 || x >= i64::from(self.info.width) || y >= i64::from(self.info.height) {
            return;
        }
        let bpp = self.info.format.bytes_per_pixel();
        let offset = y as usize * self.info.stride() + x as usize * bpp;
        match self.info.format {
            PixelFormat::Gray8 => self.pixels[offset] = color.luma(),
            PixelFormat::Rgb8 => {
                self.pixels[offset] = color.0;
                self.pixels[offset + 1] = color.1;
                self.pixels[offset + 2] = color.2;
            }
        }
    }

    fn line(&mut self, from: (i64, i64), to: (i64, i64), color: Color) {
        // Bresenham
        let (mut x, mut y) = from;
        let dx = (to.0 - x).abs();
        let dy = -(to.1 - y).abs();
        let sx = if x < to.0 { 1 } else { -1 };
        let sy = if y < to.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.put(x, y, color);
            if x == to.0 && y == to.1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn draw(&mut self, overlay: &Overlay) {
        match overlay {
            Overlay::Rect {
                x,
                y,
                width,
                height,
                color,
            } => {
                if *width == 0 || *height == 0 {
                    return;
                }
                let (x0, y0) = (i64::from(*x), i64::from(*y));
                let x1 = x0 + i64::from(*width) - 1;
                let y1 = y0 + i64::from(*height) - 1;
                self.line((x0, y0), (x1, y0), *color);
                self.line((x0, y1), (x1, y1), *color);
                self.line((x0, y0), (x0, y1), *color);
                self.line((x1, y0), (x1, y1), *color);
            }
            Overlay::Crosshair { x, y, size, color } => {
                let (cx, cy, s) = (i64::from(*x), i64::from(*y), i64::from(*size));
                self.line((cx - s, cy), (cx + s, cy), *color);
                self.line((cx, cy - s), (cx, cy + s), *color);
            }
            Overlay::Polyline { points, color } => {
                for pair in points.windows(2) {
                    let a = (i64::from(pair[0].0), i64::from(pair[0].1));
                    let b = (i64::from(pair[1].0), i64::from(pair[1].1));
                    self.line(a, b, *color);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::NullSink;

    fn frame(sequence: u64) -> FrameHandle {
        FrameHandle::from_pixels(
            sequence,
            FrameInfo::new(4, 4, PixelFormat::Gray8),
            vec![0; 16],
        )
        .unwrap()
    }

    fn ports() -> StreamPorts {
        StreamPorts::for_stream_index(0).unwrap()
    }

    fn dot(x: i32, y: i32, color: Color) -> PipelineResult {
        PipelineResult::default().with_overlay(Overlay::Crosshair {
            x,
            y,
            size: 0,
            color,
        })
    }

    #[test]
    fn test_barrier_rejects_stale_and_unknown_results() {
        let mut barrier = CycleBarrier::new("Cam0", 5);
        barrier.expect(PipelineId(1), "a", OutputFlags::default());

        assert!(!barrier.accept(4, PipelineId(1), PipelineOutcome::TimedOut));
        assert!(!barrier.accept(5, PipelineId(2), PipelineOutcome::TimedOut));
        assert!(!barrier.is_complete());
        assert!(barrier.accept(5, PipelineId(1), PipelineOutcome::Completed(Default::default())));
        assert!(!barrier.accept(5, PipelineId(1), PipelineOutcome::TimedOut));
        assert!(barrier.is_complete());
    }

    #[test]
    fn test_incomplete_barrier_cannot_finish() {
        let mut barrier = CycleBarrier::new("Cam0", 1);
        barrier.expect(PipelineId(1), "a", OutputFlags::default());
        barrier.expect(PipelineId(2), "b", OutputFlags::default());
        barrier.accept(1, PipelineId(2), PipelineOutcome::Completed(Default::default()));

        let mut barrier = barrier.finish().unwrap_err();
        assert_eq!(barrier.pending(), vec![PipelineId(1)]);
        assert_eq!(barrier.expire(), vec![PipelineId(1)]);
        let cycle = barrier.finish().unwrap();
        assert_eq!(cycle.sequence(), 1);
    }

    #[test]
    fn test_aggregate_orders_by_pipeline_id() {
        let aggregator = OutputAggregator::new(Arc::new(NullSink), 4);
        let mut barrier = CycleBarrier::new("Cam0", 9);
        for id in [3, 1, 2] {
            barrier.expect(PipelineId(id), &format!("p{id}"), OutputFlags::default());
        }
        // Pipelines 1 and 3 paint the same pixel; 3 must win
        barrier.accept(9, PipelineId(3), PipelineOutcome::Completed(dot(1, 1, Color(30, 30, 30))));
        barrier.accept(9, PipelineId(1), PipelineOutcome::Completed(dot(1, 1, Color(10, 10, 10))));
        barrier.accept(9, PipelineId(2), PipelineOutcome::Failed(ProcessingError::Failed("x".into())));

        let base = frame(9);
        let bundle = aggregator
            .aggregate(&base, ports(), barrier.finish().unwrap())
            .unwrap();

        let ids: Vec<_> = bundle.results.iter().map(|r| r.pipeline).collect();
        assert_eq!(ids, vec![PipelineId(1), PipelineId(3)]);
        assert_eq!(bundle.missing.len(), 1);
        assert_eq!(bundle.missing[0].reason, MissReason::Failed("Processing failed: x".into()));
        assert_eq!(bundle.frame.pixels[4 + 1], 30);
        // The base frame itself is untouched
        assert!(base.pixels().iter().all(|p| *p == 0));
    }

    #[test]
    fn test_aggregate_refuses_other_frame() {
        let aggregator = OutputAggregator::new(Arc::new(NullSink), 4);
        let cycle = CycleBarrier::new("Cam0", 2).finish().unwrap();
        let err = aggregator.aggregate(&frame(3), ports(), cycle).unwrap_err();
        assert!(matches!(err, VisionError::StaleCycle { frame: 3, results: 2 }));
    }

    #[test]
    fn test_output_flags_respected() {
        let aggregator = OutputAggregator::new(Arc::new(NullSink), 4);
        let mut barrier = CycleBarrier::new("Cam0", 1);
        barrier.expect(
            PipelineId(1),
            "hidden",
            OutputFlags {
                draw_overlays: false,
                publish_results: false,
            },
        );
        barrier.accept(1, PipelineId(1), PipelineOutcome::Completed(dot(0, 0, Color::GREEN)));
        let bundle = aggregator
            .aggregate(&frame(1), ports(), barrier.finish().unwrap())
            .unwrap();
        assert!(bundle.results.is_empty());
        assert!(bundle.missing.is_empty());
        assert_eq!(bundle.frame.pixels[0], 0);
    }

    #[test]
    fn test_rect_outline_clipped() {
        let mut canvas = Canvas {
            info: FrameInfo::new(4, 4, PixelFormat::Rgb8),
            pixels: vec![0; 48],
        };
        canvas.draw(&Overlay::Rect {
            x: -1,
            y: 1,
            width: 3,
            height: 10,
            color: Color::RED,
        });
        // Right edge at x=1 from y=1 down, clipped at the bottom
        for y in 1..4 {
            let offset = y * 12 + 3;
            assert_eq!(&canvas.pixels[offset..offset + 3], &[255, 0, 0]);
        }
        assert_eq!(&canvas.pixels[0..3], &[0, 0, 0]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_bundles() {
        let aggregator = OutputAggregator::new(Arc::new(NullSink), 4);
        let mut rx = aggregator.subscribe("Cam0").await;
        let cycle = CycleBarrier::new("Cam0", 1).finish().unwrap();
        let bundle = aggregator.aggregate(&frame(1), ports(), cycle).unwrap();
        aggregator.publish(bundle).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(received.ports.output, 1182);

        aggregator.forget("Cam0").await;
        assert!(rx.recv().await.is_err());
    }
}
