//! Visionloop
//!
//! Vision coprocessor runtime. Cameras and processing pipelines live in two
//! independent registries; pipelines reference a camera by name. Every camera
//! cycle captures one frame, shares it read-only with all pipelines bound to
//! the camera and merges their results into one annotated output bundle.
//!
//! The persisted camera/pipeline document is versioned and migrated from the
//! legacy per-camera layout at startup.

pub mod aggregator;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod migration;
pub mod pipeline;
pub mod ports;
pub mod router;
pub mod runtime;
pub mod sim;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use aggregator::{OutputAggregator, OutputBundle};
pub use camera::{CameraRegistry, CameraSettings, CameraView, HardwarePatch, LivenessState};
pub use config::RuntimeConfig;
pub use error::{CaptureError, ProcessingError, Result, VisionError};
pub use frame::{FrameHandle, FrameInfo, PixelFormat};
pub use migration::{ConfigMigrator, MigrationOutcome, MigrationState};
pub use pipeline::{PipelineId, PipelineRegistry, PipelineSettings, PipelineView, RunState};
pub use router::{CycleOutcome, FrameRouter};
pub use runtime::{MigrationStatus, VisionCore};
pub use source::{FrameSource, OutputSink, PipelineProcessor, SourceProvider};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};
